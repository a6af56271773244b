//! Core library for the MedTrack client.
//!
//! Owns everything about "am I logged in": the credential store, the request
//! pipeline that attaches and invalidates tokens, the session manager state
//! machine, and the push subscription that follows the signed-in user.
//!
//! A host wires it up once at startup:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use medtrack_core::auth::{open_store, SessionManager};
//! use medtrack_core::config::Config;
//!
//! let config = Config::load()?;
//! let manager = SessionManager::from_config(&config, open_store(&config)?)?;
//! let session = manager.restore().await;
//! println!("{:?}", session.phase());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod push;

pub use api::{ApiClient, ApiError, RequestMode};
pub use auth::{AuthError, AuthEvents, Credentials, Phase, Session, SessionManager};
pub use config::Config;
pub use models::UserProfile;
