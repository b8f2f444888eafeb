//! Adapter for the hosted auth + row storage service over HTTP.
//!
//! The auth endpoints live under `auth/v1`, the tables under `rest/v1`.
//! The adapter holds the current session in memory and announces every
//! change on its own event channel, which is what `subscribe` exposes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::Session,
    error::ApiErrorBody,
    protocol::{
        AuthEvent, AuthEventKind, PasswordGrantRequest, RefreshGrantRequest, SignUpResponse,
        TokenResponse,
    },
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Settings,
    error::{RemoteError, SettingsError},
    remote::{AuthApi, AuthEventStream, RowFields, TableApi},
};

const AUTH_EVENT_CAPACITY: usize = 32;

pub struct HostedBackend {
    http: Client,
    base_url: Url,
    anon_key: String,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HostedBackend {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let base_url = settings.validate()?;
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self::with_client(http, base_url, settings.anon_key.trim()))
    }

    /// `base_url` must end with `/`.
    pub fn with_client(http: Client, base_url: Url, anon_key: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            http,
            base_url,
            anon_key: anon_key.into(),
            session: Mutex::new(None),
            events,
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.held().clone()
    }

    /// Exchanges the held refresh token for a new session.
    pub async fn refresh_session(&self) -> Result<Session, RemoteError> {
        let refresh_token = self
            .held()
            .as_ref()
            .and_then(|session| session.refresh_token.clone())
            .ok_or_else(|| RemoteError::rejected(401, "no refresh token available"))?;
        let session = self
            .request_token("refresh_token", &RefreshGrantRequest { refresh_token })
            .await?;
        self.store(AuthEventKind::TokenRefreshed, Some(session.clone()));
        info!(user_id = %session.user.id, "session refreshed");
        Ok(session)
    }

    fn held(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, kind: AuthEventKind, session: Option<Session>) {
        *self.held() = session.clone();
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|err| RemoteError::Decode(format!("invalid endpoint '{path}': {err}")))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .held()
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn request_token<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<Session, RemoteError> {
        let url = self.endpoint("auth/v1/token")?;
        let res = self
            .http
            .post(url)
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await?;
        let token: TokenResponse = check(res)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        Ok(token.into_session(Utc::now()))
    }
}

/// Passes success through; otherwise turns the error body into a rejection.
async fn check(res: Response) -> Result<Response, RemoteError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(ApiErrorBody::into_message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(RemoteError::rejected(status.as_u16(), message))
}

#[async_trait]
impl AuthApi for HostedBackend {
    async fn fetch_current_session(&self) -> Result<Option<Session>, RemoteError> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };
        if !session.is_expired(Utc::now()) {
            return Ok(Some(session));
        }
        if session.refresh_token.is_none() {
            debug!("held session expired without refresh token");
            self.store(AuthEventKind::SignedOut, None);
            return Ok(None);
        }
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(RemoteError::Rejected(rejection)) => {
                warn!(error = %rejection, "refresh rejected; dropping held session");
                self.store(AuthEventKind::SignedOut, None);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn exchange_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, RemoteError> {
        let session = self
            .request_token(
                "password",
                &PasswordGrantRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        self.store(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, RemoteError> {
        let url = self.endpoint("auth/v1/signup")?;
        let res = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&PasswordGrantRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: SignUpResponse = check(res)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        match body {
            SignUpResponse::Session(token) => {
                let session = token.into_session(Utc::now());
                self.store(AuthEventKind::SignedIn, Some(session.clone()));
                Ok(Some(session))
            }
            SignUpResponse::PendingConfirmation(user) => {
                debug!(user_id = %user.id, "sign-up pending confirmation");
                Ok(None)
            }
        }
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let had_session = self.held().is_some();
        let remote = if had_session {
            let url = self.endpoint("auth/v1/logout")?;
            match self.authorized(self.http.post(url)).send().await {
                Ok(res) => check(res).await.map(|_| ()),
                Err(err) => Err(err.into()),
            }
        } else {
            Ok(())
        };
        self.store(AuthEventKind::SignedOut, None);
        remote
    }

    fn subscribe(&self) -> AuthEventStream {
        // Subscribe before reading the held session so nothing slips between.
        let later = BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "auth event subscriber lagged");
                    None
                }
            }
        });
        let initial = AuthEvent::new(AuthEventKind::InitialSession, self.current_session());
        stream::once(async move { initial }).chain(later).boxed()
    }
}

#[async_trait]
impl TableApi for HostedBackend {
    async fn insert(&self, table: &str, fields: RowFields) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let res = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(&fields)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        fields: RowFields,
        key_column: &str,
        key: i64,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let filter = format!("eq.{key}");
        let res = self
            .authorized(self.http.patch(url))
            .query(&[(key_column, filter.as_str())])
            .header("Prefer", "return=minimal")
            .json(&fields)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn select(&self, table: &str, order_by: Option<&str>) -> Result<Vec<Value>, RemoteError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let mut query = vec![("select", "*")];
        if let Some(order) = order_by {
            query.push(("order", order));
        }
        let res = self
            .authorized(self.http.get(url))
            .query(&query)
            .send()
            .await?;
        check(res)
            .await?
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/hosted_tests.rs"]
mod tests;
