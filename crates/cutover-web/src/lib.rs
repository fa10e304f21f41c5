//! HTTP surface for the cutover migration engine.
//!
//! This crate exposes:
//! - The trigger protocol (`POST /migration/{id}/trigger`)
//! - Migration views and the step catalog
//! - A push callback for the certificate provisioning backend
//! - Live state changes over Server-Sent Events

mod error;
mod routes;
mod sse;

pub use error::WebError;
pub use routes::{AppState, create_router, serve};
