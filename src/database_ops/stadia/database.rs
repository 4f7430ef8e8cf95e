//! The spider's SQLite cache: one document table per [`TableName`].

use tracing::{debug, info};

use super::seed::SeedFile;
use super::tables::{column_specs, with_table, Record, RecordKey, TableDef, TableName};
use crate::database_ops::store::{Database, Query, StoreError, StoreResult, Table};
use crate::util::env::{env_flag, env_opt};

pub type TableRecord<T> = Record<<T as TableDef>::Key, <T as TableDef>::Value>;

pub const DEFAULT_SQLITE_PATH: &str = "./spider.sqlite";

/// Row counts for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCounts {
    pub table: TableName,
    pub total: u64,
    pub with_value: u64,
    pub never_attempted: u64,
}

#[derive(Clone)]
pub struct StadiaDatabase {
    db: Database,
}

impl StadiaDatabase {
    /// Open (creating if needed) every table at `path`.
    pub fn open(path: &str) -> StoreResult<Self> {
        let db = Database::open(path)?;
        for name in TableName::ALL {
            with_table!(name, T => {
                db.table::<TableRecord<T>>(T::NAME.as_str(), &column_specs::<T>())?;
            });
        }
        info!(path, tables = TableName::ALL.len(), "stadia: database ready");
        Ok(Self { db })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:")
    }

    /// `STADIA_SQLITE` or [`DEFAULT_SQLITE_PATH`].
    pub fn from_env() -> StoreResult<Self> {
        let path = env_opt("STADIA_SQLITE").unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string());
        Self::open(&path)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn table<T: TableDef>(&self) -> StoreResult<Table<TableRecord<T>>> {
        self.db.attach(T::NAME.as_str(), &column_specs::<T>())
    }

    pub fn record<T: TableDef>(&self, key: &T::Key) -> StoreResult<Option<TableRecord<T>>> {
        let table = self.table::<T>()?;
        let filter = table.column("key")?.eq(key.to_sql());
        table.get(Query::new().filter(filter))
    }

    /// The record whose fetch was attempted longest ago (never-attempted first).
    pub fn stalest<T: TableDef>(&self) -> StoreResult<Option<TableRecord<T>>> {
        let table = self.table::<T>()?;
        let order = table
            .column("_lastUpdateAttemptedTimestamp")?
            .asc()
            .push(", ")
            .append(table.column("_lastUpdatedTimestamp")?.asc())
            .push(", rowId asc");
        Ok(table
            .select(Query::new().order_by(order).top(1))
            .collect()?
            .into_iter()
            .next())
    }

    /// Insert a stub for every built-in key plus any from `extra`, in one savepoint.
    /// Existing rows are left alone. Returns how many stubs were added.
    pub fn seed(&self, extra: Option<&SeedFile>) -> StoreResult<usize> {
        if env_flag("STADIA_SKIP_SEEDING", false) {
            info!("stadia: skipping seeding");
            return Ok(0);
        }
        let count = self.db.savepoint("seeding", || {
            let mut count = 0;
            for name in TableName::ALL {
                count += with_table!(name, T => self.seed_table::<T>(extra)?);
            }
            Ok::<_, StoreError>(count)
        })?;
        info!(count, "stadia: seeded records");
        Ok(count)
    }

    fn seed_table<T: TableDef>(&self, extra: Option<&SeedFile>) -> StoreResult<usize> {
        let table = self.table::<T>()?;
        let mut keys = T::seed_keys();
        if let Some(extra) = extra {
            for key in extra.keys(T::NAME.as_str()) {
                keys.push(serde_json::from_value::<T::Key>(key.clone())?);
            }
        }
        let mut count = 0;
        for key in keys {
            if table.insert(&Record::stub(key))? {
                count += 1;
            }
        }
        debug!(table = %T::NAME, count, "stadia: seeded table");
        Ok(count)
    }

    pub fn counts(&self) -> StoreResult<Vec<TableCounts>> {
        TableName::ALL
            .into_iter()
            .map(|name| with_table!(name, T => self.table_counts::<T>()))
            .collect()
    }

    fn table_counts<T: TableDef>(&self) -> StoreResult<TableCounts> {
        let table = self.table::<T>()?;
        Ok(TableCounts {
            table: T::NAME,
            total: table.count(None)?,
            with_value: table.count(Some(table.column("value")?.not_null()))?,
            never_attempted: table.count(Some(
                table.column("_lastUpdateAttemptedTimestamp")?.is_null(),
            ))?,
        })
    }
}
