//! Record codec: typed parameters, SQL statement builders and row mapping
//!
//! Statements are produced by pure functions of `(table, fields, values)`.
//! Every value is bound positionally except raw params, which are spliced
//! into the SQL text. Raw params exist only for the sticky
//! `first_error_message` update, and their literal is always escaped.
//!
//! # Statement shapes
//!
//! ```text
//! INSERT INTO objects (source_id, status, ...) VALUES (?, ?, ...)
//! UPDATE objects SET status = ?, first_error_message = COALESCE(...) WHERE source_id = ?
//! SELECT <all fields> FROM objects [WHERE source_id = ? | WHERE status = 'Error']
//! ```

use crate::db::record::SyncRecord;
use crate::db::schema::{fields, FieldRegistry, MD5_SIZE};
use crate::error::{DbError, DbResult};
use crate::object::{ObjectContext, ObjectStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, Value};
use rusqlite::Row;

/// Value of a single parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Bound positionally
    Bound(Value),
    /// SQL text spliced literally
    Raw(String),
}

/// One column assignment for an insert or update
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub field: &'static str,
    pub value: ParamValue,
}

impl Param {
    /// A positionally bound value
    pub fn bound(field: &'static str, value: impl Into<Value>) -> Self {
        Self {
            field,
            value: ParamValue::Bound(value.into()),
        }
    }

    /// A raw SQL expression
    pub fn raw(field: &'static str, sql: impl Into<String>) -> Self {
        Self {
            field,
            value: ParamValue::Raw(sql.into()),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.value, ParamValue::Raw(_))
    }
}

/// Ordered parameter set; setting an existing field replaces it in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn set(&mut self, param: Param) {
        match self.0.iter_mut().find(|p| p.field == param.field) {
            Some(existing) => *existing = param,
            None => self.0.push(param),
        }
    }

    /// Remove a parameter, returning it if present
    pub fn remove(&mut self, field: &str) -> Option<Param> {
        let idx = self.0.iter().position(|p| p.field == field)?;
        Some(self.0.remove(idx))
    }

    pub fn get(&self, field: &str) -> Option<&Param> {
        self.0.iter().find(|p| p.field == field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

}

impl FromIterator<Param> for Params {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Self {
        let mut params = Params::new();
        for param in iter {
            params.set(param);
        }
        params
    }
}

/// SQL text plus its positional values
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Row selection for status table queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    SourceId(String),
    Status(ObjectStatus),
}

/// Build an INSERT
///
/// With no params the statement covers every registered field in registry
/// order and carries no values; otherwise it covers exactly the given
/// params in their order.
pub fn build_insert(table: &str, registry: &FieldRegistry, params: &Params) -> Statement {
    if params.is_empty() {
        let columns = registry.column_list();
        let placeholders = vec!["?"; registry.fields().len()].join(", ");
        return Statement {
            sql: format!("INSERT INTO {} ({}) VALUES ({})", table, columns, placeholders),
            values: Vec::new(),
        };
    }

    let mut columns = Vec::with_capacity(params.len());
    let mut placeholders = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());

    for param in params.iter() {
        columns.push(param.field);
        match &param.value {
            ParamValue::Bound(value) => {
                placeholders.push("?".to_string());
                values.push(value.clone());
            }
            ParamValue::Raw(sql) => placeholders.push(sql.clone()),
        }
    }

    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        values,
    }
}

/// Build an UPDATE keyed by source id; the id is the last bound value
pub fn build_update_by_source_id(
    table: &str,
    registry: &FieldRegistry,
    params: &Params,
    source_id: &str,
) -> Statement {
    let mut assignments = Vec::new();
    let mut values = Vec::new();

    if params.is_empty() {
        // The key is matched in the WHERE clause, never reassigned
        for field in registry.fields().iter().filter(|f| f.name != fields::SOURCE_ID) {
            assignments.push(format!("{} = ?", field.name));
        }
    } else {
        for param in params.iter() {
            match &param.value {
                ParamValue::Bound(value) => {
                    assignments.push(format!("{} = ?", param.field));
                    values.push(value.clone());
                }
                ParamValue::Raw(sql) => assignments.push(format!("{} = {}", param.field, sql)),
            }
        }
    }

    values.push(Value::Text(source_id.to_string()));

    Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {} = ?",
            table,
            assignments.join(", "),
            fields::SOURCE_ID
        ),
        values,
    }
}

/// Build a SELECT over all registered fields
pub fn build_select(table: &str, registry: &FieldRegistry, filter: &RecordFilter) -> Statement {
    let base = format!("SELECT {} FROM {}", registry.column_list(), table);
    match filter {
        RecordFilter::All => Statement {
            sql: base,
            values: Vec::new(),
        },
        RecordFilter::SourceId(id) => Statement {
            sql: format!("{} WHERE {} = ?", base, fields::SOURCE_ID),
            values: vec![Value::Text(id.clone())],
        },
        // Status names are fixed identifiers, never user input
        RecordFilter::Status(status) => Statement {
            sql: format!("{} WHERE {} = '{}'", base, fields::STATUS, status.as_str()),
            values: Vec::new(),
        },
    }
}

/// Timestamp column written when a record enters `status`
pub fn status_timestamp_field(status: ObjectStatus) -> Option<&'static str> {
    match status {
        ObjectStatus::InTransfer => Some(fields::TRANSFER_START),
        ObjectStatus::Transferred => Some(fields::TRANSFER_COMPLETE),
        ObjectStatus::InVerification => Some(fields::VERIFY_START),
        ObjectStatus::Verified => Some(fields::VERIFY_COMPLETE),
        _ => None,
    }
}

/// Truncate `text` to at most `max` characters
pub fn fit_string(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Escape a literal for splicing between single quotes
pub fn escape_literal(text: &str) -> String {
    text.replace('\'', "''")
}

fn datetime_value(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Integer(dt.timestamp_millis()),
        None => Value::Null,
    }
}

fn optional_text(text: Option<String>) -> Value {
    match text {
        Some(text) => Value::Text(text),
        None => Value::Null,
    }
}

/// Maps object contexts to parameter sets and rows back to records
#[derive(Debug, Clone)]
pub struct RecordCodec {
    registry: FieldRegistry,
    max_error_size: usize,
}

impl RecordCodec {
    pub fn new(max_error_size: usize, extended: bool) -> Self {
        Self {
            registry: FieldRegistry::new(max_error_size, extended),
            max_error_size,
        }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn is_extended(&self) -> bool {
        self.registry.is_extended()
    }

    /// Truncate error text to the configured column size
    pub fn fit_error(&self, error: &str) -> String {
        fit_string(error, self.max_error_size)
    }

    /// Parameters for the first status write of an object
    pub fn insert_status_params(
        &self,
        ctx: &ObjectContext,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<Params> {
        let status = ctx.status.ok_or_else(|| DbError::MissingStatus {
            source_id: ctx.source_id().to_string(),
        })?;

        let mut params = Params::new();
        params.set(Param::bound(fields::SOURCE_ID, ctx.source_id().to_string()));
        params.set(Param::bound(fields::TARGET_ID, optional_text(ctx.target_id.clone())));
        params.set(Param::bound(fields::IS_DIRECTORY, ctx.summary.directory));
        params.set(Param::bound(fields::SIZE, ctx.summary.size as i64));
        params.set(Param::bound(fields::MTIME, datetime_value(ctx.source_mtime())));
        params.set(Param::bound(fields::STATUS, status.as_str().to_string()));
        if let Some(field) = status_timestamp_field(status) {
            params.set(Param::bound(field, now.timestamp_millis()));
        }
        params.set(Param::bound(fields::RETRY_COUNT, i64::from(ctx.failures())));
        params.set(Param::bound(
            fields::ERROR_MESSAGE,
            optional_text(error.map(|e| self.fit_error(e))),
        ));

        if self.is_extended() {
            self.add_extended_params(&mut params, ctx, status, error);
        }

        Ok(params)
    }

    fn add_extended_params(
        &self,
        params: &mut Params,
        ctx: &ObjectContext,
        status: ObjectStatus,
        error: Option<&str>,
    ) {
        if let Some(object) = &ctx.object {
            // Only plain MD5 values fit the column
            if status.is_success() {
                if let Some(md5) = object.md5_hex(false).filter(|m| m.len() <= MD5_SIZE) {
                    params.set(Param::bound(fields::SOURCE_MD5, md5));
                }
            }
            if let Some(retention) = object.metadata.retention_end {
                params.set(Param::bound(
                    fields::SOURCE_RETENTION_END,
                    retention.timestamp_millis(),
                ));
            }
        }
        if let Some(mtime) = ctx.target_mtime {
            params.set(Param::bound(fields::TARGET_MTIME, mtime.timestamp_millis()));
        }
        if let Some(md5) = ctx.target_md5.as_ref().filter(|m| m.len() <= MD5_SIZE) {
            params.set(Param::bound(fields::TARGET_MD5, md5.clone()));
        }
        if let Some(retention) = ctx.target_retention_end {
            params.set(Param::bound(
                fields::TARGET_RETENTION_END,
                retention.timestamp_millis(),
            ));
        }
        if let Some(error) = error {
            params.set(Param::bound(fields::FIRST_ERROR_MESSAGE, self.fit_error(error)));
        }
    }

    /// Parameters for a later status write; the WHERE clause is added by
    /// [`build_update_by_source_id`]
    pub fn update_status_params(
        &self,
        ctx: &ObjectContext,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<Params> {
        let mut params = self.insert_status_params(ctx, error, now)?;
        params.remove(fields::SOURCE_ID);

        match error {
            None => {
                params.remove(fields::ERROR_MESSAGE);
            }
            Some(error) => {
                params.set(Param::bound(fields::ERROR_MESSAGE, self.fit_error(error)));
            }
        }

        if self.is_extended() {
            params.remove(fields::FIRST_ERROR_MESSAGE);
            if let Some(error) = error {
                params.set(Param::raw(
                    fields::FIRST_ERROR_MESSAGE,
                    format!(
                        "COALESCE({}, '{}')",
                        fields::FIRST_ERROR_MESSAGE,
                        escape_literal(&self.fit_error(error))
                    ),
                ));
            }
        }

        Ok(params)
    }

    /// Parameters for recording a deleted source when no row exists yet
    pub fn insert_deleted_params(&self, ctx: &ObjectContext) -> Params {
        let status = ctx.status.unwrap_or(ObjectStatus::Queue);

        let mut params = Params::new();
        params.set(Param::bound(fields::SOURCE_ID, ctx.source_id().to_string()));
        params.set(Param::bound(fields::TARGET_ID, optional_text(ctx.target_id.clone())));
        params.set(Param::bound(fields::IS_DIRECTORY, ctx.summary.directory));
        params.set(Param::bound(fields::SIZE, ctx.summary.size as i64));
        params.set(Param::bound(fields::MTIME, datetime_value(ctx.source_mtime())));
        params.set(Param::bound(fields::STATUS, status.as_str().to_string()));
        params.set(Param::bound(fields::IS_SOURCE_DELETED, true));
        params
    }

    /// Parameters for flagging an existing row's source as deleted
    pub fn update_deleted_params(&self) -> Params {
        let mut params = Params::new();
        params.set(Param::bound(fields::IS_SOURCE_DELETED, true));
        params
    }

    /// Map a row to a record
    ///
    /// Only `source_id` is required. Every other column is probed first and
    /// left at its default when the result set does not carry it.
    pub fn map_row(&self, row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
        let source_id: String = row.get(fields::SOURCE_ID)?;

        let status = probe::<String>(row, fields::STATUS)?.and_then(|s| s.parse().ok());

        Ok(SyncRecord {
            source_id,
            target_id: probe(row, fields::TARGET_ID)?,
            directory: probe(row, fields::IS_DIRECTORY)?.unwrap_or(false),
            size: probe::<i64>(row, fields::SIZE)?.unwrap_or(0).max(0) as u64,
            mtime: probe_datetime(row, fields::MTIME)?,
            status,
            transfer_start: probe_datetime(row, fields::TRANSFER_START)?,
            transfer_complete: probe_datetime(row, fields::TRANSFER_COMPLETE)?,
            verify_start: probe_datetime(row, fields::VERIFY_START)?,
            verify_complete: probe_datetime(row, fields::VERIFY_COMPLETE)?,
            retry_count: probe::<i64>(row, fields::RETRY_COUNT)?.unwrap_or(0).max(0) as u32,
            error_message: probe(row, fields::ERROR_MESSAGE)?,
            source_deleted: probe(row, fields::IS_SOURCE_DELETED)?.unwrap_or(false),
            source_md5: probe(row, fields::SOURCE_MD5)?,
            source_retention_end: probe_datetime(row, fields::SOURCE_RETENTION_END)?,
            target_mtime: probe_datetime(row, fields::TARGET_MTIME)?,
            target_md5: probe(row, fields::TARGET_MD5)?,
            target_retention_end: probe_datetime(row, fields::TARGET_RETENTION_END)?,
            first_error_message: probe(row, fields::FIRST_ERROR_MESSAGE)?,
        })
    }
}

/// Read a nullable column if the result set has it
fn probe<T: FromSql>(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<T>> {
    match row.as_ref().column_index(name) {
        Ok(idx) => row.get(idx),
        Err(_) => Ok(None),
    }
}

fn probe_datetime(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(probe::<i64>(row, name)?.and_then(DateTime::<Utc>::from_timestamp_millis))
}
