use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::domain::{EntryFields, EntryRow, TaxFields, TaxRow};
use tracing::info;

pub mod config;
pub mod error;
pub mod hosted;
pub mod mutation;
pub mod notify;
pub mod remote;
pub mod session;

pub use error::{RemoteError, SessionError, SettingsError};
pub use hosted::HostedBackend;
pub use mutation::{
    EntryForm, FailureReason, Form, MutationOutcome, MutationRequest, MutationWorkflow, Record,
    TaxForm, ValidationErrors, WriteMode,
};
pub use notify::{BroadcastNotifier, Notification, NotificationSink, Severity, TracingNotifier};
pub use remote::{AuthApi, TableApi};
pub use session::{AuthPhase, AuthState, SessionSynchronizer};

use config::Settings;

/// Owns the auth state for one client session and hands out the edit
/// workflows. Created at startup, torn down with [`ClientContext::shutdown`].
pub struct ClientContext {
    pub session: Arc<SessionSynchronizer>,
    tables: Arc<dyn TableApi>,
    notifier: Arc<dyn NotificationSink>,
}

impl ClientContext {
    pub fn new(
        auth: Arc<dyn AuthApi>,
        tables: Arc<dyn TableApi>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let session = SessionSynchronizer::spawn(auth, Arc::clone(&notifier));
        Self {
            session,
            tables,
            notifier,
        }
    }

    /// Connects to the hosted backend described by `settings`.
    pub fn connect(
        settings: &Settings,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, SettingsError> {
        let backend = Arc::new(HostedBackend::from_settings(settings)?);
        info!(backend_url = %settings.backend_url, "client context created");
        Ok(Self::new(backend.clone(), backend, notifier))
    }

    pub fn entries(&self) -> MutationWorkflow<EntryFields> {
        MutationWorkflow::new(Arc::clone(&self.tables), Arc::clone(&self.notifier))
    }

    pub fn taxes(&self) -> MutationWorkflow<TaxFields> {
        MutationWorkflow::new(Arc::clone(&self.tables), Arc::clone(&self.notifier))
    }

    /// Rows for the parent-entry pick-list, newest first.
    pub async fn list_entries(&self) -> Result<Vec<EntryRow>, RemoteError> {
        let rows = self
            .tables
            .select(<EntryFields as Record>::TABLE, Some("date.desc"))
            .await?;
        decode_rows(rows)
    }

    pub async fn list_taxes(&self) -> Result<Vec<TaxRow>, RemoteError> {
        let rows = self
            .tables
            .select(<TaxFields as Record>::TABLE, Some("period.desc"))
            .await?;
        decode_rows(rows)
    }

    pub fn shutdown(&self) {
        self.session.teardown();
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RemoteError> {
    rows.into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<T>, _>>()
        .map_err(|err| RemoteError::Decode(format!("unexpected row shape: {err}")))
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
