//! PatchCore anomaly detection.
//!
//! An input image is decoded and normalized, pushed through a frozen ResNet-50,
//! and the activations of two intermediate stages are pooled onto a 28x28 grid.
//! Every grid cell ("patch") is compared against a memory bank of patch features
//! taken from normal samples; the cosine distance to the nearest neighbour is the
//! anomaly value of that patch and the worst patch decides the verdict.

pub mod backbone;
pub mod config;
pub mod error;
pub mod features;
pub mod index;
pub mod memory_bank;
pub mod numeric;
pub mod pipeline;
pub mod preprocess;
pub mod scorer;
pub mod types;
pub mod visualize;

pub use error::{Error, Result};
pub use pipeline::InferenceContext;
