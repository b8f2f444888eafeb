use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Session, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl AuthEventKind {
    /// Only an explicit sign-out clears; every other kind establishes the
    /// session it carries.
    pub fn clears_session(self) -> bool {
        matches!(self, Self::SignedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    /// The session this event leaves in place.
    pub fn effective_session(&self) -> Option<Session> {
        if self.kind.clears_session() {
            None
        } else {
            self.session.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordGrantRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshGrantRequest {
    pub refresh_token: String,
}

/// Body of a successful sign-up: a full session when the service signs the
/// new account in immediately, otherwise just the pending user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignUpResponse {
    Session(TokenResponse),
    PendingConfirmation(User),
}

/// Successful response of the token endpoint for every grant type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user: User,
}

impl TokenResponse {
    pub fn into_session(self, issued_at: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| issued_at + chrono::Duration::seconds(self.expires_in));
        Session {
            access_token: self.access_token,
            token_type: self.token_type,
            expires_in: self.expires_in,
            expires_at,
            refresh_token: self.refresh_token,
            user: self.user,
        }
    }
}
