use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use shared::{
    domain::{Session, User},
    protocol::AuthEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::RemoteError,
    notify::{Notification, NotificationSink, Severity},
    remote::{AuthApi, AuthEventStream, RowFields, TableApi},
};

pub fn session_for(id: &str, email: &str) -> Session {
    Session {
        access_token: format!("token-{id}"),
        token_type: "bearer".into(),
        expires_in: 3600,
        expires_at: DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc),
        refresh_token: Some(format!("refresh-{id}")),
        user: User {
            id: id.into(),
            email: Some(email.into()),
        },
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.notifications.lock().expect("notifications").clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|notification| notification.severity == severity)
            .collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications
            .lock()
            .expect("notifications")
            .push(notification);
    }
}

type FetchResult = Result<Option<Session>, RemoteError>;

/// Handles a test uses to drive [`FakeAuth`].
pub struct AuthControls {
    pub fetch: oneshot::Sender<FetchResult>,
    pub events: mpsc::UnboundedSender<AuthEvent>,
}

pub struct FakeAuth {
    fetch_rx: Mutex<Option<oneshot::Receiver<FetchResult>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AuthEvent>>>,
    sign_in_results: Mutex<VecDeque<Result<Session, RemoteError>>>,
    sign_up_results: Mutex<VecDeque<Result<Option<Session>, RemoteError>>>,
    sign_out_results: Mutex<VecDeque<Result<(), RemoteError>>>,
    pub credentials: Mutex<Vec<(String, String)>>,
    pub fetch_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
}

impl FakeAuth {
    pub fn new() -> (Arc<Self>, AuthControls) {
        let (fetch_tx, fetch_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let auth = Arc::new(Self {
            fetch_rx: Mutex::new(Some(fetch_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            sign_in_results: Mutex::new(VecDeque::new()),
            sign_up_results: Mutex::new(VecDeque::new()),
            sign_out_results: Mutex::new(VecDeque::new()),
            credentials: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        });
        (
            auth,
            AuthControls {
                fetch: fetch_tx,
                events: events_tx,
            },
        )
    }

    pub fn push_sign_in(&self, result: Result<Session, RemoteError>) {
        self.sign_in_results
            .lock()
            .expect("sign-in results")
            .push_back(result);
    }

    pub fn push_sign_up(&self, result: Result<Option<Session>, RemoteError>) {
        self.sign_up_results
            .lock()
            .expect("sign-up results")
            .push_back(result);
    }

    pub fn push_sign_out(&self, result: Result<(), RemoteError>) {
        self.sign_out_results
            .lock()
            .expect("sign-out results")
            .push_back(result);
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn fetch_current_session(&self) -> Result<Option<Session>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let rx = self.fetch_rx.lock().expect("fetch rx").take();
        match rx {
            Some(rx) => rx.await.unwrap_or(Ok(None)),
            None => Ok(None),
        }
    }

    async fn exchange_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, RemoteError> {
        self.credentials
            .lock()
            .expect("credentials")
            .push((email.to_string(), password.to_string()));
        self.sign_in_results
            .lock()
            .expect("sign-in results")
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::rejected(400, "Invalid login credentials")))
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, RemoteError> {
        self.credentials
            .lock()
            .expect("credentials")
            .push((email.to_string(), password.to_string()));
        self.sign_up_results
            .lock()
            .expect("sign-up results")
            .pop_front()
            .unwrap_or(Ok(None))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_out_results
            .lock()
            .expect("sign-out results")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn subscribe(&self) -> AuthEventStream {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        match self.events_rx.lock().expect("events rx").take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableCall {
    Insert {
        table: String,
        fields: RowFields,
    },
    Update {
        table: String,
        fields: RowFields,
        key_column: String,
        key: i64,
    },
    Select {
        table: String,
        order_by: Option<String>,
    },
}

#[derive(Default)]
pub struct RecordingTables {
    pub calls: Mutex<Vec<TableCall>>,
    reject_with: Mutex<Option<String>>,
    rows: Mutex<Vec<Value>>,
}

impl RecordingTables {
    pub fn rejecting(message: &str) -> Self {
        let tables = Self::default();
        *tables.reject_with.lock().expect("reject") = Some(message.to_string());
        tables
    }

    pub fn with_rows(rows: Vec<Value>) -> Self {
        let tables = Self::default();
        *tables.rows.lock().expect("rows") = rows;
        tables
    }

    pub fn calls(&self) -> Vec<TableCall> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: TableCall) -> Result<(), RemoteError> {
        self.calls.lock().expect("calls").push(call);
        match self.reject_with.lock().expect("reject").clone() {
            Some(message) => Err(RemoteError::rejected(400, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TableApi for RecordingTables {
    async fn insert(&self, table: &str, fields: RowFields) -> Result<(), RemoteError> {
        self.record(TableCall::Insert {
            table: table.to_string(),
            fields,
        })
    }

    async fn update(
        &self,
        table: &str,
        fields: RowFields,
        key_column: &str,
        key: i64,
    ) -> Result<(), RemoteError> {
        self.record(TableCall::Update {
            table: table.to_string(),
            fields,
            key_column: key_column.to_string(),
            key,
        })
    }

    async fn select(&self, table: &str, order_by: Option<&str>) -> Result<Vec<Value>, RemoteError> {
        self.record(TableCall::Select {
            table: table.to_string(),
            order_by: order_by.map(str::to_string),
        })?;
        Ok(self.rows.lock().expect("rows").clone())
    }
}
