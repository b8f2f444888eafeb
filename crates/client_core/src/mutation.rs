//! Create-or-update workflow behind the entry and tax edit dialogs.

use std::{collections::BTreeMap, fmt, marker::PhantomData, sync::Arc};

use chrono::NaiveDate;
use serde::Serialize;
use shared::domain::{EntryFields, EntryId, EntryKind, EntryRow, TaxFields, TaxId, TaxRow};
use tracing::{debug, info, warn};

use crate::{
    notify::{Notification, NotificationSink},
    remote::{RowFields, TableApi},
};

pub const SUCCESS_TITLE: &str = "Success";

/// A validated field set that maps onto one table.
pub trait Record: Serialize + Send + Sync + 'static {
    type Id: Copy + fmt::Debug + Send + Sync + 'static;

    const TABLE: &'static str;
    const KEY_COLUMN: &'static str = "id";
    const CREATED_MESSAGE: &'static str;
    const UPDATED_MESSAGE: &'static str;
    const FAILURE_TITLE: &'static str;

    /// Row key for an identifier, or `None` when it names no row.
    fn key(id: Self::Id) -> Option<i64>;
}

impl Record for EntryFields {
    type Id = EntryId;

    const TABLE: &'static str = "entries";
    const CREATED_MESSAGE: &'static str = "Entry created successfully";
    const UPDATED_MESSAGE: &'static str = "Entry updated successfully";
    const FAILURE_TITLE: &'static str = "Error saving entry";

    fn key(id: EntryId) -> Option<i64> {
        id.is_present().then_some(id.0)
    }
}

impl Record for TaxFields {
    type Id = TaxId;

    const TABLE: &'static str = "taxes";
    const CREATED_MESSAGE: &'static str = "Tax created successfully";
    const UPDATED_MESSAGE: &'static str = "Tax updated successfully";
    const FAILURE_TITLE: &'static str = "Error saving tax";

    fn key(id: TaxId) -> Option<i64> {
        id.is_present().then_some(id.0)
    }
}

/// Raw dialog input that validates into a [`Record`].
pub trait Form: Send {
    type Output: Record;

    fn validate(&self) -> Result<Self::Output, ValidationErrors>;
}

/// Per-field validation messages, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, String>,
}

impl ValidationErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields
            .iter()
            .map(|(field, message)| (*field, message.as_str()))
    }

    fn finish<T>(self, value: impl FnOnce() -> T) -> Result<T, Self> {
        if self.is_empty() {
            Ok(value())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (field, message)) in self.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{field}: {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryForm {
    pub description: String,
    pub amount: String,
    pub date: String,
    pub kind: String,
    pub category: String,
}

impl EntryForm {
    /// Prefills the form from a stored row for editing.
    pub fn from_row(row: &EntryRow) -> Self {
        let fields = &row.fields;
        Self {
            description: fields.description.clone(),
            amount: format_amount(fields.amount),
            date: fields.date.format("%Y-%m-%d").to_string(),
            kind: match fields.kind {
                EntryKind::Income => "income".into(),
                EntryKind::Expense => "expense".into(),
            },
            category: fields.category.clone(),
        }
    }
}

impl Form for EntryForm {
    type Output = EntryFields;

    fn validate(&self) -> Result<EntryFields, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let description = required_text(&mut errors, "description", &self.description, "Description");
        let amount = parse_amount(&mut errors, &self.amount);
        let date = match self.date.trim() {
            "" => {
                errors.add("date", "Date is required");
                None
            }
            raw => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| errors.add("date", "Date must be formatted as YYYY-MM-DD"))
                .ok(),
        };
        let kind = match self.kind.trim() {
            "" => {
                errors.add("type", "Type is required");
                None
            }
            raw => {
                let parsed = EntryKind::parse(raw);
                if parsed.is_none() {
                    errors.add("type", "Type must be income or expense");
                }
                parsed
            }
        };
        let category = required_text(&mut errors, "category", &self.category, "Category");

        match (description, amount, date, kind, category) {
            (Some(description), Some(amount), Some(date), Some(kind), Some(category)) => {
                errors.finish(|| EntryFields {
                    description,
                    amount,
                    date,
                    kind,
                    category,
                })
            }
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxForm {
    pub kind: String,
    pub amount: String,
    pub period: String,
    pub entry_id: String,
}

impl TaxForm {
    pub fn from_row(row: &TaxRow) -> Self {
        let fields = &row.fields;
        Self {
            kind: fields.kind.clone(),
            amount: format_amount(fields.amount),
            period: fields.period.clone(),
            entry_id: fields.entry_id.0.to_string(),
        }
    }
}

impl Form for TaxForm {
    type Output = TaxFields;

    fn validate(&self) -> Result<TaxFields, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let kind = required_text(&mut errors, "type", &self.kind, "Type");
        let amount = parse_amount(&mut errors, &self.amount);
        let period = match self.period.trim() {
            "" => {
                errors.add("period", "Period is required");
                None
            }
            raw => {
                let valid = raw.len() == 7
                    && NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").is_ok();
                if !valid {
                    errors.add("period", "Period must be formatted as YYYY-MM");
                }
                valid.then(|| raw.to_string())
            }
        };
        let entry_id = match self.entry_id.trim() {
            "" => {
                errors.add("entry_id", "Parent entry is required");
                None
            }
            raw => match raw.parse::<i64>().map(EntryId) {
                Ok(id) if id.is_present() => Some(id),
                _ => {
                    errors.add("entry_id", "Parent entry must reference an existing entry");
                    None
                }
            },
        };

        match (kind, amount, period, entry_id) {
            (Some(kind), Some(amount), Some(period), Some(entry_id)) => {
                errors.finish(|| TaxFields {
                    kind,
                    amount,
                    period,
                    entry_id,
                })
            }
            _ => Err(errors),
        }
    }
}

fn required_text(
    errors: &mut ValidationErrors,
    field: &'static str,
    raw: &str,
    label: &str,
) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        errors.add(field, format!("{label} is required"));
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_amount(errors: &mut ValidationErrors, raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        errors.add("amount", "Amount is required");
        return None;
    }
    match trimmed.replace(',', ".").parse::<f64>() {
        Ok(amount) if amount.is_finite() && amount > 0.0 => Some(amount),
        Ok(_) => {
            errors.add("amount", "Amount must be greater than zero");
            None
        }
        Err(_) => {
            errors.add("amount", "Amount must be a number");
            None
        }
    }
}

fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("{amount:.0}")
    } else {
        amount.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update(i64),
}

/// One submission from a dialog. Consumed by [`MutationWorkflow::submit`].
pub struct MutationRequest<F: Form> {
    pub form: F,
    pub existing_id: Option<<F::Output as Record>::Id>,
}

impl<F: Form> MutationRequest<F> {
    pub fn create(form: F) -> Self {
        Self {
            form,
            existing_id: None,
        }
    }

    pub fn update(form: F, id: <F::Output as Record>::Id) -> Self {
        Self {
            form,
            existing_id: Some(id),
        }
    }

    pub fn mode(&self) -> WriteMode {
        match self.existing_id.and_then(<F::Output as Record>::key) {
            Some(key) => WriteMode::Update(key),
            None => WriteMode::Create,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Rejected locally; nothing was sent.
    Validation(ValidationErrors),
    /// Rejected by the remote write, message verbatim.
    Persistence(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Success,
    Failure { reason: FailureReason },
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn persistence(message: impl Into<String>) -> Self {
        Self::Failure {
            reason: FailureReason::Persistence(message.into()),
        }
    }
}

type Completion = Box<dyn Fn() + Send + Sync>;

pub struct MutationWorkflow<R: Record> {
    tables: Arc<dyn TableApi>,
    notifier: Arc<dyn NotificationSink>,
    on_success: Option<Completion>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> MutationWorkflow<R> {
    pub fn new(tables: Arc<dyn TableApi>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            tables,
            notifier,
            on_success: None,
            _record: PhantomData,
        }
    }

    /// Callback fired once per successful submission.
    pub fn on_success(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub async fn submit<F>(&self, request: MutationRequest<F>) -> MutationOutcome
    where
        F: Form<Output = R>,
    {
        let mode = request.mode();
        let record = match request.form.validate() {
            Ok(record) => record,
            Err(errors) => {
                debug!(table = R::TABLE, %errors, "submission rejected by validation");
                return MutationOutcome::Failure {
                    reason: FailureReason::Validation(errors),
                };
            }
        };

        let fields = match row_fields(&record) {
            Ok(fields) => fields,
            Err(message) => {
                warn!(table = R::TABLE, error = %message, "failed to encode row");
                self.notifier.notify(failure_notification::<R>(&message));
                return MutationOutcome::persistence(message);
            }
        };

        let written = match mode {
            WriteMode::Create => self.tables.insert(R::TABLE, fields).await,
            WriteMode::Update(key) => {
                self.tables
                    .update(R::TABLE, fields, R::KEY_COLUMN, key)
                    .await
            }
        };

        match written {
            Ok(()) => {
                info!(table = R::TABLE, ?mode, "record saved");
                let message = match mode {
                    WriteMode::Create => R::CREATED_MESSAGE,
                    WriteMode::Update(_) => R::UPDATED_MESSAGE,
                };
                self.notifier
                    .notify(Notification::info(SUCCESS_TITLE, message));
                if let Some(callback) = &self.on_success {
                    callback();
                }
                MutationOutcome::Success
            }
            Err(err) => {
                let message = err.user_message();
                warn!(table = R::TABLE, ?mode, error = %message, "record write rejected");
                self.notifier.notify(failure_notification::<R>(&message));
                MutationOutcome::persistence(message)
            }
        }
    }
}

/// The remote message appears in the title as well as the detail.
fn failure_notification<R: Record>(message: &str) -> Notification {
    Notification::destructive(format!("{}: {message}", R::FAILURE_TITLE), message)
}

/// Serializes the content columns; the key column never travels in the body.
fn row_fields<R: Record>(record: &R) -> Result<RowFields, String> {
    match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(mut fields)) => {
            fields.remove(R::KEY_COLUMN);
            Ok(fields)
        }
        Ok(other) => Err(format!("row must encode as an object, got {other}")),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;
