//! Authentication module for managing the client session.
//!
//! This module provides:
//! - `SessionManager`: login, registration, logout, and startup restore
//! - `CredentialStore`: persistent token storage with file, keychain, and memory backends
//! - `AuthEvents`: the invalidation broadcast the request pipeline uses to end a session
//!
//! Tokens are issued by the server and never expire locally; the server's
//! 401 is the only thing that invalidates one.

pub mod credentials;
pub mod error;
pub mod events;
pub mod session;

pub use credentials::{open_store, Credential, CredentialStore, Credentials, FileStore, KeyringStore, MemoryStore};
pub use error::{AuthError, RegistrationFailure};
pub use events::{AuthEvents, Subscription};
pub use session::{Phase, Session, SessionManager};
