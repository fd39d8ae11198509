//! REST API transport for the UrbanLens backend.
//!
//! This module provides the `ApiClient` for JSON requests against the
//! configured base URL. Requests carry a bearer token from the active
//! `TokenStore` when one is present; a 401/403 clears that token.
//!
//! Server errors, network failures and timeouts are retried with a linear
//! backoff. Everything else fails on the first attempt.

pub mod client;
pub mod error;

pub use client::{ApiClient, TransportConfig};
pub use error::ApiError;
