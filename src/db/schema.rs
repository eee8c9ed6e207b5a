//! Status table schema: field registry, DDL and additive column migration
//!
//! The ordered list of [`FieldDescriptor`]s is the single description of the
//! status table. It drives table creation, column migration, statement
//! generation in [`crate::db::codec`] and row mapping.

use crate::error::DbResult;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info};

/// Default status table name
pub const DEFAULT_TABLE_NAME: &str = "objects";

/// Default size of the error message column
pub const DEFAULT_MAX_ERROR_SIZE: usize = 2048;

/// Size of identifier columns
pub const ID_SIZE: usize = 750;

/// Size of MD5 hex columns
pub const MD5_SIZE: usize = 32;

/// Column names
pub mod fields {
    pub const SOURCE_ID: &str = "source_id";
    pub const TARGET_ID: &str = "target_id";
    pub const IS_DIRECTORY: &str = "is_directory";
    pub const SIZE: &str = "size";
    pub const MTIME: &str = "mtime";
    pub const STATUS: &str = "status";
    pub const TRANSFER_START: &str = "transfer_start";
    pub const TRANSFER_COMPLETE: &str = "transfer_complete";
    pub const VERIFY_START: &str = "verify_start";
    pub const VERIFY_COMPLETE: &str = "verify_complete";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const IS_SOURCE_DELETED: &str = "is_source_deleted";

    pub const SOURCE_MD5: &str = "source_md5";
    pub const SOURCE_RETENTION_END: &str = "source_retention_end";
    pub const TARGET_MTIME: &str = "target_mtime";
    pub const TARGET_MD5: &str = "target_md5";
    pub const TARGET_RETENTION_END: &str = "target_retention_end";
    pub const FIRST_ERROR_MESSAGE: &str = "first_error_message";
}

/// Column type of a registered field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Boolean,
    BigInt,
    Int,
    DateTime,
}

/// Static description of one status table column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
    /// Maximum length for string columns; `None` means unbounded
    pub size: Option<usize>,
    pub nullable: bool,
}

impl FieldDescriptor {
    const fn new(
        name: &'static str,
        field_type: FieldType,
        size: Option<usize>,
        nullable: bool,
    ) -> Self {
        Self {
            name,
            field_type,
            size,
            nullable,
        }
    }

    /// SQL type used in CREATE/ALTER statements
    pub fn sql_type(&self) -> String {
        match (self.field_type, self.size) {
            (FieldType::String, Some(size)) => format!("VARCHAR({})", size),
            (FieldType::String, None) => "TEXT".to_string(),
            (FieldType::Boolean, _) => "BOOL".to_string(),
            (FieldType::BigInt, _) => "BIGINT".to_string(),
            (FieldType::Int, _) => "INT".to_string(),
            (FieldType::DateTime, _) => "DATETIME".to_string(),
        }
    }

    /// Column definition fragment, e.g. `status VARCHAR(32) NOT NULL`
    pub fn column_definition(&self) -> String {
        if self.nullable {
            format!("{} {}", self.name, self.sql_type())
        } else {
            format!("{} {} NOT NULL", self.name, self.sql_type())
        }
    }
}

/// Base fields, in registry order; the error message size is configurable
fn base_fields(max_error_size: usize) -> Vec<FieldDescriptor> {
    use fields::*;
    use FieldType::*;

    vec![
        FieldDescriptor::new(SOURCE_ID, String, Some(ID_SIZE), false),
        FieldDescriptor::new(TARGET_ID, String, Some(ID_SIZE), true),
        FieldDescriptor::new(IS_DIRECTORY, Boolean, None, false),
        FieldDescriptor::new(SIZE, BigInt, None, true),
        FieldDescriptor::new(MTIME, DateTime, None, true),
        FieldDescriptor::new(STATUS, String, Some(32), false),
        FieldDescriptor::new(TRANSFER_START, DateTime, None, true),
        FieldDescriptor::new(TRANSFER_COMPLETE, DateTime, None, true),
        FieldDescriptor::new(VERIFY_START, DateTime, None, true),
        FieldDescriptor::new(VERIFY_COMPLETE, DateTime, None, true),
        FieldDescriptor::new(RETRY_COUNT, Int, None, true),
        FieldDescriptor::new(ERROR_MESSAGE, String, Some(max_error_size), true),
        FieldDescriptor::new(IS_SOURCE_DELETED, Boolean, None, true),
    ]
}

/// Extended fields, appended after the base set when enabled
pub const EXTENDED_FIELDS: [FieldDescriptor; 6] = [
    FieldDescriptor::new(fields::SOURCE_MD5, FieldType::String, Some(MD5_SIZE), true),
    FieldDescriptor::new(fields::SOURCE_RETENTION_END, FieldType::DateTime, None, true),
    FieldDescriptor::new(fields::TARGET_MTIME, FieldType::DateTime, None, true),
    FieldDescriptor::new(fields::TARGET_MD5, FieldType::String, Some(MD5_SIZE), true),
    FieldDescriptor::new(fields::TARGET_RETENTION_END, FieldType::DateTime, None, true),
    FieldDescriptor::new(fields::FIRST_ERROR_MESSAGE, FieldType::String, None, true),
];

/// Ordered registry of status table fields
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    fields: Vec<FieldDescriptor>,
    extended: bool,
}

impl FieldRegistry {
    /// Build the registry for the given error column size and extended flag
    pub fn new(max_error_size: usize, extended: bool) -> Self {
        let mut fields = base_fields(max_error_size);
        if extended {
            fields.extend_from_slice(&EXTENDED_FIELDS);
        }
        Self { fields, extended }
    }

    /// All fields in registry order
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Only the base fields
    pub fn base(&self) -> &[FieldDescriptor] {
        let len = if self.extended {
            self.fields.len() - EXTENDED_FIELDS.len()
        } else {
            self.fields.len()
        };
        &self.fields[..len]
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Look up a field by column name
    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Comma-separated column list in registry order
    pub fn column_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pragmas applied to every pooled connection
pub const CONNECTION_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// CREATE TABLE statement covering the base fields
///
/// Extended columns are added by [`migrate_extended_columns`] so that a
/// table created without them and a table created with them converge.
pub fn create_table_sql(table: &str, registry: &FieldRegistry) -> String {
    let mut columns: Vec<String> = registry
        .base()
        .iter()
        .map(FieldDescriptor::column_definition)
        .collect();
    columns.push(format!("PRIMARY KEY ({})", fields::SOURCE_ID));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        table,
        columns.join(",\n    ")
    )
}

/// Index on the status column
pub fn create_status_index_sql(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table}({})",
        fields::STATUS
    )
}

/// Create the status table and its index if absent, then add any missing
/// extended columns
pub fn create_table(conn: &Connection, table: &str, registry: &FieldRegistry) -> DbResult<()> {
    conn.execute(&create_table_sql(table, registry), [])?;
    conn.execute(&create_status_index_sql(table), [])?;

    if registry.is_extended() {
        let added = migrate_extended_columns(conn, table)?;
        if !added.is_empty() {
            info!(table, columns = ?added, "Added extended status columns");
        }
    }

    debug!(table, extended = registry.is_extended(), "Status table ready");
    Ok(())
}

/// Column names currently present on the table
///
/// Probes result-set metadata of an empty select rather than the catalog.
pub fn existing_columns(conn: &Connection, table: &str) -> DbResult<HashSet<String>> {
    let stmt = conn.prepare(&format!("SELECT * FROM {} WHERE 1 = 0", table))?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    Ok(columns)
}

/// Add extended columns that the table lacks; returns the names added
///
/// Safe to run repeatedly: present columns are never touched.
pub fn migrate_extended_columns(conn: &Connection, table: &str) -> DbResult<Vec<&'static str>> {
    let existing = existing_columns(conn, table)?;
    let mut added = Vec::new();

    for field in EXTENDED_FIELDS.iter() {
        if existing.contains(field.name) {
            continue;
        }
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {}", table, field.column_definition()),
            [],
        )?;
        added.push(field.name);
    }

    Ok(added)
}

/// Drop the status table
pub fn drop_table(conn: &Connection, table: &str) -> DbResult<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    Ok(())
}
