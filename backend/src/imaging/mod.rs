pub mod normalizer;

pub use normalizer::{ensure_jpeg, sniff_mime};
