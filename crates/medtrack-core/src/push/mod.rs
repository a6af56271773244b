//! Dose-reminder push notifications.
//!
//! Registration is gated on the session: whenever a user becomes present the
//! client registers with the platform's push service and hands the resulting
//! descriptor to the server. Nothing is torn down when the user goes away.

pub mod registrar;
pub mod subscriber;

pub use registrar::{NoopRegistrar, PushError, PushRegistrar};
pub use subscriber::PushSubscriber;
