pub mod mask;

pub use mask::{causal_mask, padding_mask};
