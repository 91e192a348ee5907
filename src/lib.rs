//! acestep-api: REST API server for the ACE-Step audio generation model.
//!
//! A single-process HTTP service exposing generation-submission endpoints
//! behind a bounded job queue, plus synchronous language-model endpoints
//! (`/lm/inspire`, `/lm/format`, `/lm/understand`). The model manager is
//! the sole owner of accelerator memory: it loads the DiT eagerly,
//! initializes the LM per the `auto|true|false` policy, and offloads idle
//! models to CPU when configured.

pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod server;
