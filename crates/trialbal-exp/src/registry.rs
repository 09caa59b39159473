use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use trialbal_core::{ErrorInfo, TrialError};

use crate::results::ResultRow;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS results (
    algorithm TEXT NOT NULL,
    n_subjects INTEGER NOT NULL,
    n_groups INTEGER NOT NULL,
    n_covariates INTEGER NOT NULL,
    placement_interval INTEGER NOT NULL,
    experiment_id INTEGER NOT NULL,
    covariate_name TEXT NOT NULL,
    is_used TEXT NOT NULL,
    pvalue REAL NOT NULL,
    diversity_all REAL NOT NULL,
    diversity_used REAL NOT NULL
)";

const INSERT: &str = "INSERT INTO results VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

/// Persistent store of result rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Registry {
    Csv(PathBuf),
    Sqlite(PathBuf),
}

/// Filter for registry lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Query {
    /// Keep only rows of this algorithm.
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    fn admits(&self, algorithm: &str) -> bool {
        self.algorithm.as_deref().map_or(true, |wanted| wanted == algorithm)
    }
}

/// Stored rows with every value rendered as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn empty() -> Self {
        Self {
            columns: ResultRow::COLUMNS.iter().map(|column| column.to_string()).collect(),
            rows: Vec::new(),
        }
    }
}

impl Registry {
    /// `.sqlite` and `.db` select SQLite; any other path is a CSV file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("sqlite") | Some("db") => Registry::Sqlite(path),
            _ => Registry::Csv(path),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        match self {
            Registry::Csv(path) | Registry::Sqlite(path) => path,
        }
    }

    fn append(&self, rows: &[ResultRow]) -> Result<(), TrialError> {
        let path = self.path();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| registry_error("registry-create", parent, err))?;
        }
        match self {
            Registry::Csv(_) => append_csv(path, rows)?,
            Registry::Sqlite(_) => append_sqlite(path, rows)?,
        }
        debug!(registry = %path.display(), rows = rows.len(), "registry appended");
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Table, TrialError> {
        let path = self.path();
        if !path.exists() {
            return Ok(Table::empty());
        }
        let rows = match self {
            Registry::Csv(_) => query_csv(path, query)?,
            Registry::Sqlite(_) => query_sqlite(path, query)?,
        };
        Ok(Table { rows, ..Table::empty() })
    }
}

/// Appends result rows; a new CSV file gets the header first.
pub fn registry_append(registry: &Registry, rows: &[ResultRow]) -> Result<(), TrialError> {
    registry.append(rows)
}

/// Reads stored rows matching `query` in insertion order. A missing file reads as empty.
pub fn registry_query(registry: &Registry, query: &Query) -> Result<Table, TrialError> {
    registry.query(query)
}

fn append_csv(path: &Path, rows: &[ResultRow]) -> Result<(), TrialError> {
    let fresh = fs::metadata(path).map_or(true, |meta| meta.len() == 0);
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|err| registry_error("registry-open", path, err))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    if fresh {
        writer
            .write_record(ResultRow::COLUMNS)
            .map_err(|err| registry_error("registry-write", path, err))?;
    }
    for row in rows {
        writer
            .write_record(row.to_record())
            .map_err(|err| registry_error("registry-write", path, err))?;
    }
    writer.flush().map_err(|err| registry_error("registry-flush", path, err))
}

fn query_csv(path: &Path, query: &Query) -> Result<Vec<Vec<String>>, TrialError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|err| registry_error("registry-read", path, err))?;
    let limit = query.limit.unwrap_or(usize::MAX);
    let mut rows = Vec::new();
    for record in reader.records() {
        if rows.len() >= limit {
            break;
        }
        let record: StringRecord = record.map_err(|err| registry_error("registry-record", path, err))?;
        if query.admits(record.get(0).unwrap_or_default()) {
            rows.push(record.iter().map(str::to_string).collect());
        }
    }
    Ok(rows)
}

fn append_sqlite(path: &Path, rows: &[ResultRow]) -> Result<(), TrialError> {
    let mut conn = Connection::open(path).map_err(|err| registry_error("registry-open", path, err))?;
    conn.execute_batch(SCHEMA)
        .map_err(|err| registry_error("registry-schema", path, err))?;
    let tx = conn
        .transaction()
        .map_err(|err| registry_error("registry-transaction", path, err))?;
    {
        let mut insert = tx
            .prepare(INSERT)
            .map_err(|err| registry_error("registry-prepare", path, err))?;
        for row in rows {
            insert
                .execute(params![
                    row.algorithm.as_str(),
                    row.n_subjects as i64,
                    row.n_groups as i64,
                    row.n_covariates as i64,
                    row.placement_interval as i64,
                    row.experiment_id as i64,
                    row.covariate_name,
                    row.is_used.to_string(),
                    row.pvalue,
                    row.diversity_all,
                    row.diversity_used,
                ])
                .map_err(|err| registry_error("registry-insert", path, err))?;
        }
    }
    tx.commit().map_err(|err| registry_error("registry-commit", path, err))
}

fn query_sqlite(path: &Path, query: &Query) -> Result<Vec<Vec<String>>, TrialError> {
    let conn = Connection::open(path).map_err(|err| registry_error("registry-open", path, err))?;
    // -1 means no limit to SQLite
    let limit = query.limit.map_or(-1, |limit| limit as i64);
    let sql = format!(
        "SELECT {} FROM results WHERE ?1 IS NULL OR algorithm = ?1 ORDER BY rowid LIMIT ?2",
        ResultRow::COLUMNS.join(", ")
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| registry_error("registry-prepare", path, err))?;
    let rows = stmt
        .query_map(params![query.algorithm, limit], render_row)
        .map_err(|err| registry_error("registry-query", path, err))?;
    let rendered = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| registry_error("registry-row", path, err));
    rendered
}

fn render_row(row: &Row<'_>) -> rusqlite::Result<Vec<String>> {
    (0..ResultRow::COLUMNS.len())
        .map(|idx| {
            Ok(match row.get::<_, SqlValue>(idx)? {
                SqlValue::Null => String::new(),
                SqlValue::Integer(x) => x.to_string(),
                SqlValue::Real(x) => x.to_string(),
                SqlValue::Text(text) => text,
                SqlValue::Blob(bytes) => format!("<{} bytes>", bytes.len()),
            })
        })
        .collect()
}

fn registry_error(code: &str, path: &Path, err: impl ToString) -> TrialError {
    TrialError::Serde(
        ErrorInfo::new(code, "result registry failure")
            .with_context("path", path.display().to_string())
            .with_hint(err.to_string()),
    )
}
