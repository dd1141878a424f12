pub mod config;
pub mod device;
pub mod layers;
pub mod loader;
pub mod models;
pub mod peft;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
