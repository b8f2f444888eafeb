//! Contracts of the hosted backend consumed by the session and mutation logic.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use shared::{domain::Session, protocol::AuthEvent};

use crate::error::RemoteError;

pub type AuthEventStream = BoxStream<'static, AuthEvent>;

/// Column content of a single row write.
pub type RowFields = Map<String, Value>;

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn fetch_current_session(&self) -> Result<Option<Session>, RemoteError>;
    async fn exchange_credentials(&self, email: &str, password: &str)
        -> Result<Session, RemoteError>;
    /// Registers an account. `None` means the service wants the address
    /// confirmed before it issues a session.
    async fn sign_up(&self, email: &str, password: &str)
        -> Result<Option<Session>, RemoteError>;
    async fn sign_out(&self) -> Result<(), RemoteError>;
    /// Opens the push channel of auth events.
    ///
    /// The first item reflects the current state; the stream ends when the
    /// returned value is dropped.
    fn subscribe(&self) -> AuthEventStream;
}

#[async_trait]
pub trait TableApi: Send + Sync {
    async fn insert(&self, table: &str, fields: RowFields) -> Result<(), RemoteError>;
    async fn update(
        &self,
        table: &str,
        fields: RowFields,
        key_column: &str,
        key: i64,
    ) -> Result<(), RemoteError>;
    async fn select(&self, table: &str, order_by: Option<&str>) -> Result<Vec<Value>, RemoteError>;
}
