use candle_core::{DType, Device, Result, Tensor};

/// Generate a causal attention mask for decoder self-attention.
/// Returns shape [1, 1, seq_len, seq_len + seqlen_offset].
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    mask.to_dtype(dtype)
}

/// Turn a `[batch, seq_len]` 0/1 attention mask into an additive mask.
///
/// Returns shape [batch, 1, 1, seq_len] with 0 for kept positions and a
/// large negative value for padding, ready to broadcast over attention scores.
pub fn padding_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b_sz, seq_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    // (1 - mask) * -1e9 keeps the mask finite so fully padded rows stay NaN-free.
    let additive = ((keep.ones_like()? - keep)? * -1e9f64)?;
    additive.reshape((b_sz, 1, 1, seq_len))?.to_dtype(dtype)
}
