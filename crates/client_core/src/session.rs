//! Authoritative client-side auth state.
//!
//! Two inputs race at startup: a one-shot fetch of the held session and the
//! push stream of auth events. Whichever resolves first ends the loading
//! window; once any push event (or an explicit sign-in/sign-out) has been
//! applied, a late fetch result is discarded so the push source always wins.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::StreamExt;
use shared::{
    domain::{Session, User},
    protocol::AuthEvent,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    notify::{Notification, NotificationSink},
    remote::{AuthApi, AuthEventStream},
};

pub const SIGN_IN_FAILED_TITLE: &str = "Sign-in failed";
pub const SIGNED_OUT_TITLE: &str = "Signed out";
pub const SIGNED_OUT_DESCRIPTION: &str = "You have been signed out";
pub const SIGN_UP_FAILED_TITLE: &str = "Sign-up failed";
pub const SIGN_UP_PENDING_TITLE: &str = "Confirm your email";
pub const SIGN_UP_PENDING_DESCRIPTION: &str =
    "Check your inbox for the link that activates your account";

const STATE_CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Initializing,
    Unauthenticated,
    Authenticated,
}

/// Snapshot of the current identity. The user is always read off the
/// session so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    session: Option<Session>,
    loading: bool,
}

impl AuthState {
    pub fn initializing() -> Self {
        Self {
            session: None,
            loading: true,
        }
    }

    fn resolved(session: Option<Session>) -> Self {
        Self {
            session,
            loading: false,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|session| &session.user)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> AuthPhase {
        match (&self.session, self.loading) {
            (Some(_), _) => AuthPhase::Authenticated,
            (None, true) => AuthPhase::Initializing,
            (None, false) => AuthPhase::Unauthenticated,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initializing()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateSource {
    InitialFetch,
    Subscription,
    SignIn,
    SignUp,
    SignOut,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    torn_down: bool,
    /// Set once anything other than the initial fetch has written state.
    authoritative_write: bool,
    fetch_task: Option<JoinHandle<()>>,
    listener_task: Option<JoinHandle<()>>,
}

pub struct SessionSynchronizer {
    auth: Arc<dyn AuthApi>,
    notifier: Arc<dyn NotificationSink>,
    state: watch::Sender<AuthState>,
    changes: broadcast::Sender<AuthState>,
    /// Flips to `true` on teardown so `ready()` never outlives the component.
    closed: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl SessionSynchronizer {
    /// Builds an idle synchronizer; nothing is fetched until [`Self::start`].
    pub fn new(auth: Arc<dyn AuthApi>, notifier: Arc<dyn NotificationSink>) -> Arc<Self> {
        let (state, _) = watch::channel(AuthState::initializing());
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            auth,
            notifier,
            state,
            changes,
            closed,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn spawn(auth: Arc<dyn AuthApi>, notifier: Arc<dyn NotificationSink>) -> Arc<Self> {
        let synchronizer = Self::new(auth, notifier);
        synchronizer.start();
        synchronizer
    }

    /// Issues the initial session fetch and opens the event subscription.
    /// Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.started || lifecycle.torn_down {
            return;
        }
        lifecycle.started = true;

        let auth = Arc::clone(&self.auth);
        let weak = Arc::downgrade(self);
        lifecycle.fetch_task = Some(tokio::spawn(async move {
            let fetched = auth.fetch_current_session().await;
            let Some(synchronizer) = weak.upgrade() else {
                return;
            };
            let session = match fetched {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "initial session fetch failed; treating as signed out");
                    None
                }
            };
            let _ = synchronizer.apply(UpdateSource::InitialFetch, session);
        }));

        let events = self.auth.subscribe();
        lifecycle.listener_task = Some(tokio::spawn(listen(Arc::downgrade(self), events)));
        debug!("session synchronizer started");
    }

    /// Releases the subscription. Later events never reach the state.
    pub fn teardown(&self) {
        let (fetch_task, listener_task) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.torn_down {
                return;
            }
            lifecycle.torn_down = true;
            (lifecycle.fetch_task.take(), lifecycle.listener_task.take())
        };
        self.closed.send_replace(true);
        if let Some(task) = fetch_task {
            task.abort();
        }
        if let Some(task) = listener_task {
            task.abort();
            info!("auth subscription released");
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Latest-value view of the state.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn state_stream(&self) -> WatchStream<AuthState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Receives every replacement state, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthState> {
        self.changes.subscribe()
    }

    /// Resolves once the loading window has closed, or with the last
    /// snapshot once the synchronizer is torn down.
    pub async fn ready(&self) -> AuthState {
        let mut state = self.state.subscribe();
        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = state.wait_for(|state| !state.is_loading()) => {}
            _ = closed.wait_for(|closed| *closed) => {}
        }
        self.state()
    }

    pub fn is_torn_down(&self) -> bool {
        self.lifecycle().torn_down
    }

    pub fn require_user(&self) -> Result<User, SessionError> {
        self.state
            .borrow()
            .user()
            .cloned()
            .ok_or(SessionError::NotAuthenticated)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, SessionError> {
        self.ensure_live()?;
        match self.auth.exchange_credentials(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "sign-in succeeded");
                // Applied directly so observers never see a signed-out gap
                // before the matching event arrives.
                self.apply(UpdateSource::SignIn, Some(session.clone()))?;
                Ok(session)
            }
            Err(err) => {
                let message = err.user_message();
                warn!(error = %message, "sign-in rejected");
                self.notifier
                    .notify(Notification::destructive(SIGN_IN_FAILED_TITLE, message.clone()));
                Err(SessionError::Credential(message))
            }
        }
    }

    /// Registers a new account. Services that confirm by email return no
    /// session; the state then stays signed out.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Session>, SessionError> {
        self.ensure_live()?;
        match self.auth.sign_up(email, password).await {
            Ok(Some(session)) => {
                info!(user_id = %session.user.id, "sign-up succeeded");
                self.apply(UpdateSource::SignUp, Some(session.clone()))?;
                Ok(Some(session))
            }
            Ok(None) => {
                info!("sign-up awaiting email confirmation");
                self.notifier.notify(Notification::info(
                    SIGN_UP_PENDING_TITLE,
                    SIGN_UP_PENDING_DESCRIPTION,
                ));
                Ok(None)
            }
            Err(err) => {
                let message = err.user_message();
                warn!(error = %message, "sign-up rejected");
                self.notifier
                    .notify(Notification::destructive(SIGN_UP_FAILED_TITLE, message.clone()));
                Err(SessionError::SignUp(message))
            }
        }
    }

    /// Clears local state whatever the remote call reports.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        let remote = self.auth.sign_out().await;
        self.apply(UpdateSource::SignOut, None)?;
        match remote {
            Ok(()) => {
                info!("signed out");
                self.notifier.notify(Notification::info(
                    SIGNED_OUT_TITLE,
                    SIGNED_OUT_DESCRIPTION,
                ));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "remote sign-out failed; local session cleared");
                Err(SessionError::SignOut(err.user_message()))
            }
        }
    }

    fn handle_event(&self, event: AuthEvent) {
        debug!(kind = ?event.kind, "auth event received");
        let _ = self.apply(UpdateSource::Subscription, event.effective_session());
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_torn_down() {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// Single entry point for every state write. Reports whether the
    /// published state changed.
    fn apply(&self, source: UpdateSource, session: Option<Session>) -> Result<bool, SessionError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.torn_down {
            debug!(?source, "dropping auth update after teardown");
            return Err(SessionError::Disposed);
        }
        if source == UpdateSource::InitialFetch && lifecycle.authoritative_write {
            debug!("initial session fetch resolved late; push state kept");
            return Ok(false);
        }
        if source != UpdateSource::InitialFetch {
            lifecycle.authoritative_write = true;
        }

        let next = AuthState::resolved(session);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            info!(
                ?source,
                phase = ?next.phase(),
                user_id = next.user().map(|user| user.id.as_str()),
                "auth state replaced"
            );
            let _ = self.changes.send(next);
        }
        Ok(changed)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionSynchronizer {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn listen(synchronizer: Weak<SessionSynchronizer>, mut events: AuthEventStream) {
    while let Some(event) = events.next().await {
        let Some(synchronizer) = synchronizer.upgrade() else {
            break;
        };
        synchronizer.handle_event(event);
    }
    debug!("auth event stream ended");
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
