//! REST API client module for MedTrack services.
//!
//! This module provides the `ApiClient`, the request pipeline every call to
//! the server goes through, and the auth endpoint wrappers the session
//! manager builds on.
//!
//! The API uses bearer token authentication; the token is read from the
//! credential store on every request.

pub mod client;
pub mod error;

pub use client::{ApiClient, RequestMode};
pub use error::ApiError;
