//! Schema-driven document tables over SQLite.
//!
//! Each table stores one validated JSON document per row in a `json` column
//! and exposes declared dot-paths into that document as generated columns.
//! `unique` and `indexed` projections are stored and indexed; `virtual`
//! projections exist only to make ad hoc queries easier.

use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use regex::Regex;
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::util::sql::{quote_identifier, Sql, SqlValue};

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_$]{1,64}$").expect("static regex"));
static COLUMN_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_$]+(\.[A-Za-z0-9_$]+)*$").expect("static regex")
});
const MAX_COLUMN_PATH_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {table} document: {message}")]
    Invalid { table: String, message: String },
    #[error("invalid identifier {0:?}")]
    Identifier(String),
    #[error("column {column:?} declared twice in {table}")]
    DuplicateColumn { table: String, column: String },
    #[error("no column {column:?} in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("get() on {table} expected at most one row but found more")]
    Ambiguous { table: String },
    #[error("first() on {table} found no rows")]
    NotFound { table: String },
    #[error("database connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Virtual,
    Indexed,
    Unique,
}

/// Whether documents are validated on their way in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    #[default]
    Checked,
    /// For trusted internal paths, e.g. re-importing rows that were validated when written.
    Unchecked,
}

/// A value storable in a [`Table`].
///
/// Structural validity comes from deserialization; `validate` adds the
/// cross-field rules a type alone cannot express.
pub trait Document: Serialize + DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub path: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(path: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// A generated column, usable to build filter and ordering fragments.
#[derive(Debug, Clone)]
pub struct Column {
    table: String,
    name: String,
    path: String,
    kind: ColumnKind,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    pub fn sql(&self) -> Sql {
        Sql::new().ident(&self.table).push(".").ident(&self.name)
    }

    fn compare(&self, op: &str, other: impl Into<SqlValue>) -> Sql {
        self.sql().push(&format!(" {op} ")).bind(other)
    }

    pub fn eq(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare("=", other)
    }

    pub fn ne(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare("!=", other)
    }

    pub fn lt(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare("<", other)
    }

    pub fn lte(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare("<=", other)
    }

    pub fn gt(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare(">", other)
    }

    pub fn gte(&self, other: impl Into<SqlValue>) -> Sql {
        self.compare(">=", other)
    }

    pub fn is_null(&self) -> Sql {
        self.sql().push(" is null")
    }

    pub fn not_null(&self) -> Sql {
        self.sql().push(" is not null")
    }

    pub fn asc(&self) -> Sql {
        self.sql().push(" asc")
    }

    pub fn desc(&self) -> Sql {
        self.sql().push(" desc")
    }
}

/// Filter, ordering and limit for reads.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Option<Sql>,
    pub order_by: Option<Sql>,
    pub top: Option<usize>,
    pub validation: Validation,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Sql) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order_by: Sql) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.validation = Validation::Unchecked;
        self
    }
}

/// Shared handle to one SQLite file (or in-memory database).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA busy_timeout = 3000;")?;
        debug!(path, "opened sqlite database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a statement, returning the number of changed rows.
    pub fn execute(&self, query: &Sql) -> StoreResult<usize> {
        trace!(sql = %query, values = ?query.values(), "execute");
        let conn = self.lock()?;
        Ok(conn.execute(&query.text(), query.params().as_slice())?)
    }

    fn query_strings(&self, query: &Sql) -> StoreResult<Vec<String>> {
        trace!(sql = %query, values = ?query.values(), "query");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query.text())?;
        let rows = stmt.query_map(query.params().as_slice(), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_i64(&self, query: &Sql) -> StoreResult<i64> {
        trace!(sql = %query, values = ?query.values(), "query");
        let conn = self.lock()?;
        Ok(conn.query_row(&query.text(), query.params().as_slice(), |row| row.get(0))?)
    }

    /// Run `f` inside a named savepoint; any error rolls back everything `f` wrote.
    pub fn savepoint<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let ident = quote_identifier(name);
        self.lock()?
            .execute_batch(&format!("savepoint {ident}"))
            .map_err(StoreError::from)?;
        match f() {
            Ok(value) => {
                self.lock()?
                    .execute_batch(&format!("release {ident}"))
                    .map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                let rollback = self
                    .lock()
                    .and_then(|conn| {
                        conn.execute_batch(&format!("rollback to {ident}; release {ident}"))
                            .map_err(StoreError::from)
                    });
                if let Err(rollback_err) = rollback {
                    warn!(savepoint = name, error = %rollback_err, "savepoint rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Create (if needed) and open a document table with the given projections.
    pub fn table<D: Document>(&self, name: &str, specs: &[ColumnSpec]) -> StoreResult<Table<D>> {
        let table = self.attach::<D>(name, specs)?;
        self.create(&table.name, &table.columns)?;
        Ok(table)
    }

    /// Open a handle to a table that [`Database::table`] has already created.
    pub fn attach<D: Document>(&self, name: &str, specs: &[ColumnSpec]) -> StoreResult<Table<D>> {
        if !TABLE_NAME.is_match(name) {
            return Err(StoreError::Identifier(name.to_string()));
        }

        let mut columns: Vec<Column> = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.path.len() > MAX_COLUMN_PATH_LEN || !COLUMN_PATH.is_match(&spec.path) {
                return Err(StoreError::Identifier(spec.path.clone()));
            }
            let physical = spec.path.rsplit('.').next().unwrap_or(&spec.path).to_string();
            if columns.iter().any(|c| c.name == physical) {
                return Err(StoreError::DuplicateColumn {
                    table: name.to_string(),
                    column: physical,
                });
            }
            columns.push(Column {
                table: name.to_string(),
                name: physical,
                path: spec.path.clone(),
                kind: spec.kind,
            });
        }

        Ok(Table {
            db: self.clone(),
            name: name.to_string(),
            columns,
            _document: PhantomData,
        })
    }

    fn create(&self, name: &str, columns: &[Column]) -> StoreResult<()> {
        let mut definition = String::from(
            "rowId integer primary key autoincrement not null,\n  json text not null check (json_valid(json))",
        );
        let mut indexes = Vec::new();
        for column in columns {
            let storage = match column.kind {
                ColumnKind::Virtual => "virtual",
                ColumnKind::Indexed | ColumnKind::Unique => "stored",
            };
            // Paths are restricted to [A-Za-z0-9_$.] above, so the literal cannot break out.
            definition.push_str(&format!(
                ",\n  {} generated always as (json_extract(json, '$.{}')) {storage}",
                quote_identifier(&column.name),
                column.path,
            ));
            let index = match column.kind {
                ColumnKind::Virtual => None,
                ColumnKind::Indexed => Some(("", "indexed")),
                ColumnKind::Unique => Some(("unique ", "unique")),
            };
            if let Some((unique, suffix)) = index {
                indexes.push(format!(
                    "create {unique}index if not exists {} on {} ({})",
                    quote_identifier(&format!("{name}.{}::{suffix}", column.path)),
                    quote_identifier(name),
                    quote_identifier(&column.name),
                ));
            }
        }

        {
            let conn = self.lock()?;
            conn.execute_batch(&format!(
                "create table if not exists {} (\n  {definition}\n)",
                quote_identifier(name)
            ))?;
            for statement in &indexes {
                conn.execute_batch(statement)?;
            }
        }
        debug!(table = name, columns = columns.len(), "created table");
        Ok(())
    }
}

pub struct Table<D> {
    db: Database,
    name: String,
    columns: Vec<Column>,
    _document: PhantomData<fn() -> D>,
}

impl<D> Clone for Table<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            name: self.name.clone(),
            columns: self.columns.clone(),
            _document: PhantomData,
        }
    }
}

impl<D: Document> Table<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by declared path (`value.name`) or physical name (`name`).
    pub fn column(&self, path: &str) -> StoreResult<&Column> {
        self.columns
            .iter()
            .find(|c| c.path == path || c.name == path)
            .ok_or_else(|| StoreError::UnknownColumn {
                table: self.name.clone(),
                column: path.to_string(),
            })
    }

    fn id(&self) -> Sql {
        Sql::new().ident(&self.name)
    }

    fn encode(&self, document: &D, validation: Validation) -> StoreResult<String> {
        if validation == Validation::Checked {
            document.validate().map_err(|message| StoreError::Invalid {
                table: self.name.clone(),
                message,
            })?;
        }
        Ok(serde_json::to_string(document)?)
    }

    fn decode(&self, json: &str, validation: Validation) -> StoreResult<D> {
        let document: D = serde_json::from_str(json).map_err(|err| StoreError::Invalid {
            table: self.name.clone(),
            message: err.to_string(),
        })?;
        if validation == Validation::Checked {
            document.validate().map_err(|message| StoreError::Invalid {
                table: self.name.clone(),
                message,
            })?;
        }
        Ok(document)
    }

    pub fn count(&self, filter: Option<Sql>) -> StoreResult<u64> {
        let query = Sql::raw("select count(*) from ")
            .append(self.id())
            .push(" where ")
            .append(filter.unwrap_or_else(|| Sql::raw("true")));
        let count = self.db.query_i64(&query)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Insert unless a row with the same unique projections exists. Returns whether a row was added.
    pub fn insert(&self, document: &D) -> StoreResult<bool> {
        self.insert_with(document, Validation::Checked)
    }

    pub fn insert_with(&self, document: &D, validation: Validation) -> StoreResult<bool> {
        let json = self.encode(document, validation)?;
        debug!(table = %self.name, "insert");
        let query = Sql::raw("insert into ")
            .append(self.id())
            .push(" (json) values (")
            .bind(json)
            .push(") on conflict do nothing");
        Ok(self.db.execute(&query)? > 0)
    }

    /// Insert, replacing any row that collides on a unique projection.
    pub fn update(&self, document: &D) -> StoreResult<()> {
        self.update_with(document, Validation::Checked)
    }

    pub fn update_with(&self, document: &D, validation: Validation) -> StoreResult<()> {
        let json = self.encode(document, validation)?;
        debug!(table = %self.name, "insert-or-replace");
        let query = Sql::raw("insert or replace into ")
            .append(self.id())
            .push(" (json) values (")
            .bind(json)
            .push(")");
        self.db.execute(&query)?;
        Ok(())
    }

    pub fn delete(&self, filter: Sql) -> StoreResult<usize> {
        let query = Sql::raw("delete from ")
            .append(self.id())
            .push(" where ")
            .append(filter);
        self.db.execute(&query)
    }

    /// A lazily evaluated query; nothing runs until [`Selection::iter`] is called.
    pub fn select(&self, query: Query) -> Selection<'_, D> {
        Selection { table: self, query }
    }

    /// The single matching row, `None` when nothing matches, or an error when several do.
    pub fn get(&self, query: Query) -> StoreResult<Option<D>> {
        let query = Query {
            top: Some(2),
            ..query
        };
        let mut rows = self.select(query).iter()?;
        let first = rows.next().transpose()?;
        if rows.next().is_some() {
            return Err(StoreError::Ambiguous {
                table: self.name.clone(),
            });
        }
        Ok(first)
    }

    /// The first matching row; an error when nothing matches.
    pub fn first(&self, query: Query) -> StoreResult<D> {
        let query = Query {
            top: Some(1),
            ..query
        };
        self.select(query)
            .iter()?
            .next()
            .transpose()?
            .ok_or_else(|| StoreError::NotFound {
                table: self.name.clone(),
            })
    }
}

pub struct Selection<'t, D> {
    table: &'t Table<D>,
    query: Query,
}

impl<'t, D: Document> Selection<'t, D> {
    /// Run the query. Each call re-runs it against the current table contents.
    pub fn iter(&self) -> StoreResult<SelectionIter<'t, D>> {
        let mut sql = Sql::raw("select json from ")
            .append(self.table.id())
            .push(" where ")
            .append(self.query.filter.clone().unwrap_or_else(|| Sql::raw("true")))
            .push(" order by ")
            .append(
                self.query
                    .order_by
                    .clone()
                    .unwrap_or_else(|| Sql::raw("rowId asc")),
            );
        if let Some(top) = self.query.top {
            sql = sql
                .push(" limit ")
                .bind(i64::try_from(top).unwrap_or(i64::MAX));
        }
        let rows = self.table.db.query_strings(&sql)?;
        Ok(SelectionIter {
            table: self.table,
            rows: rows.into_iter(),
            validation: self.query.validation,
        })
    }

    pub fn collect(&self) -> StoreResult<Vec<D>> {
        self.iter()?.collect()
    }
}

/// Decodes (and validates) rows one at a time as they are consumed.
pub struct SelectionIter<'t, D> {
    table: &'t Table<D>,
    rows: std::vec::IntoIter<String>,
    validation: Validation,
}

impl<D: Document> Iterator for SelectionIter<'_, D> {
    type Item = StoreResult<D>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows
            .next()
            .map(|json| self.table.decode(&json, self.validation))
    }
}
