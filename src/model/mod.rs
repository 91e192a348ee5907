//! Model ownership and inference.
//!
//! - [`device`]: accelerator discovery and selection
//! - [`dit`]: diffusion-transformer generation pipeline
//! - [`lm`]: language model operations (inspire/format/understand)
//! - [`manager`]: load/offload state machine over both models

pub mod device;
pub mod dit;
pub mod lm;
pub mod manager;
