//! Data models for the authentication and notification endpoints.
//!
//! Request bodies serialize to the server's camelCase JSON; response types
//! tolerate fields this client does not know about.

pub mod push;
pub mod user;

pub use push::{PushKeys, PushSubscription};
pub use user::{AuthResponse, LoginRequest, NewAccount, UserProfile};
