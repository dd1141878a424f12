//! Decoding helpers used by seq2seq generation.

mod beam;

pub use beam::{beam_search_top_k, BeamHypothesis, BeamSearchConfig, BeamSearchState};

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, -1.0]), 1);
        assert_eq!(argmax(&[]), 0);
    }
}
