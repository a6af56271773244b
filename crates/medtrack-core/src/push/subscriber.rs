use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::auth::Session;
use crate::models::UserProfile;

use super::{PushError, PushRegistrar};

/// What happened to the session while a registration was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watched {
    Steady,
    SignedOut,
    Closed,
}

/// Registers for push whenever a user appears in the session.
pub struct PushSubscriber<R> {
    registrar: R,
    api: ApiClient,
}

/// A registration is due when a user appears, or a different user replaces
/// the previous one.
fn should_subscribe(previous: Option<&UserProfile>, current: Option<&UserProfile>) -> bool {
    match (previous, current) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(prev), Some(curr)) => prev.identity() != curr.identity() || prev.identity().is_none(),
    }
}

impl<R: PushRegistrar> PushSubscriber<R> {
    pub fn new(registrar: R, api: ApiClient) -> Self {
        Self { registrar, api }
    }

    /// Register and submit. Failures are logged, never returned.
    pub async fn subscribe_for(&self, user: &UserProfile) -> bool {
        let subscription = match self.registrar.register().await {
            Ok(subscription) => subscription,
            Err(PushError::Unsupported) => {
                debug!("Push not supported, skipping registration");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Push registration failed");
                return false;
            }
        };

        if subscription.is_expired() {
            warn!(endpoint = %subscription.endpoint, "Push service returned an expired subscription");
            return false;
        }

        match self.api.submit_push_subscription(&subscription).await {
            Ok(()) => {
                info!(user = user.display_name(), "Push subscription registered");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to submit push subscription");
                false
            }
        }
    }

    /// Follow session changes until the session manager goes away.
    pub async fn run(self, mut session: watch::Receiver<Session>) {
        let mut previous: Option<UserProfile> = None;
        loop {
            let current = session.borrow_and_update().user().cloned();
            let mut outcome = Watched::Steady;
            if should_subscribe(previous.as_ref(), current.as_ref()) {
                if let Some(ref user) = current {
                    outcome = self.subscribe_watching(user, &mut session).await;
                }
            }
            // A sign-out seen mid-registration means the next user is new,
            // even if it is the same account again
            previous = match outcome {
                Watched::SignedOut => None,
                Watched::Steady | Watched::Closed => current,
            };

            if outcome == Watched::Closed || session.changed().await.is_err() {
                debug!("Session closed, push subscriber stopping");
                break;
            }
        }
    }

    /// Register for `user` while still observing the session, since changes
    /// made during registration would otherwise be merged away.
    async fn subscribe_watching(&self, user: &UserProfile, session: &mut watch::Receiver<Session>) -> Watched {
        let registration = self.subscribe_for(user);
        tokio::pin!(registration);

        let mut outcome = Watched::Steady;
        loop {
            tokio::select! {
                _ = &mut registration => return outcome,
                changed = session.changed(), if outcome != Watched::Closed => match changed {
                    Ok(()) => {
                        if !session.borrow().is_authenticated() {
                            outcome = Watched::SignedOut;
                        }
                    }
                    Err(_) => outcome = Watched::Closed,
                },
            }
        }
    }

    pub fn spawn(self, session: watch::Receiver<Session>) -> JoinHandle<()>
    where
        R: 'static,
    {
        tokio::spawn(self.run(session))
    }
}
