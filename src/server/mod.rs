//! HTTP API surface.
//!
//! - [`auth`]: API-key gating
//! - [`routes`]: router assembly and handlers
//! - [`types`]: wire DTOs and the response envelope

pub mod auth;
pub mod routes;
pub mod types;
