use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Zero and negative identifiers never name a stored row.
            pub fn is_present(self) -> bool {
                self.0 > 0
            }
        }
    };
}

id_newtype!(EntryId);
id_newtype!(TaxId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Credential bundle issued by the hosted auth service.
///
/// Replaced wholesale on every transition; nothing patches individual fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user: User,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Income,
    Expense,
}

impl EntryKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "income" => Some(Self::Income),
            "expense" => Some(Self::Expense),
            _ => None,
        }
    }
}

/// Content columns of a row in the `entries` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFields {
    pub description: String,
    pub amount: f64,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRow {
    pub id: EntryId,
    #[serde(flatten)]
    pub fields: EntryFields,
}

/// Content columns of a row in the `taxes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxFields {
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: f64,
    /// Billing period as `YYYY-MM`.
    pub period: String,
    pub entry_id: EntryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRow {
    pub id: TaxId,
    #[serde(flatten)]
    pub fields: TaxFields,
}
