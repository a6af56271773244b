use std::future::Future;

use thiserror::Error;

use crate::models::PushSubscription;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Push notifications are not supported on this platform")]
    Unsupported,

    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Push registration failed: {0}")]
    Registration(String),
}

/// Platform push service: asks for permission and produces a subscription.
pub trait PushRegistrar: Send + Sync {
    fn register(&self) -> impl Future<Output = Result<PushSubscription, PushError>> + Send;
}

/// For hosts without a push service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrar;

impl PushRegistrar for NoopRegistrar {
    async fn register(&self) -> Result<PushSubscription, PushError> {
        Err(PushError::Unsupported)
    }
}
