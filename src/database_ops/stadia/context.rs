//! What a table's request and parse steps may read and write while a record is
//! being fetched.

use chrono::Utc;
use tracing::trace;

use super::database::{StadiaDatabase, TableRecord};
use super::tables::{Record, TableDef};
use super::StadiaError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// The value is a partial view (e.g. a friend-list entry) and must not
    /// replace a value that is already cached.
    pub incomplete: bool,
}

pub trait RequestContext {
    /// Epoch milliseconds at which the current fetch started.
    fn request_timestamp(&self) -> i64;

    /// The cached value for `key`, which must already have been fetched.
    fn get_dependency<T: TableDef>(&self, key: &T::Key) -> Result<T::Value, StadiaError>;

    /// Record something learned about another record. `None` only ensures the
    /// key exists. Returns whether anything was written.
    fn update<T: TableDef>(
        &self,
        key: &T::Key,
        value: Option<&T::Value>,
        options: UpdateOptions,
    ) -> Result<bool, StadiaError>;
}

/// What an update should write given what is already stored, or `None` to leave it alone.
pub fn merge_update<T: TableDef>(
    existing: Option<TableRecord<T>>,
    key: &T::Key,
    value: Option<&T::Value>,
    options: UpdateOptions,
    timestamp: i64,
) -> Option<TableRecord<T>> {
    match (existing, value) {
        (None, None) => Some(Record::stub(key.clone())),
        (Some(_), None) => None,
        (Some(existing), Some(_)) if options.incomplete && existing.value.is_some() => None,
        (existing, Some(value)) => Some(Record {
            key: key.clone(),
            value: Some(value.clone()),
            request: None,
            response: None,
            last_updated_timestamp: Some(timestamp),
            last_update_attempted_timestamp: existing
                .and_then(|record| record.last_update_attempted_timestamp),
        }),
    }
}

/// A context backed by the spider's database. Writes go straight to the
/// connection, so callers wrap a whole fetch in a savepoint.
pub struct DatabaseRequestContext<'a> {
    db: &'a StadiaDatabase,
    request_timestamp: i64,
}

impl<'a> DatabaseRequestContext<'a> {
    pub fn new(db: &'a StadiaDatabase) -> Self {
        Self {
            db,
            request_timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl RequestContext for DatabaseRequestContext<'_> {
    fn request_timestamp(&self) -> i64 {
        self.request_timestamp
    }

    fn get_dependency<T: TableDef>(&self, key: &T::Key) -> Result<T::Value, StadiaError> {
        self.db
            .record::<T>(key)?
            .and_then(|record| record.value)
            .ok_or_else(|| StadiaError::DependencyMissing {
                table: T::NAME,
                key: key.to_string(),
            })
    }

    fn update<T: TableDef>(
        &self,
        key: &T::Key,
        value: Option<&T::Value>,
        options: UpdateOptions,
    ) -> Result<bool, StadiaError> {
        let table = self.db.table::<T>()?;
        let existing = self.db.record::<T>(key)?;
        let existed = existing.is_some();
        let Some(record) = merge_update::<T>(existing, key, value, options, self.request_timestamp)
        else {
            trace!(table = %T::NAME, %key, incomplete = options.incomplete, "stadia: update skipped");
            return Ok(false);
        };
        if existed {
            table.update(&record)?;
            Ok(true)
        } else {
            Ok(table.insert(&record)?)
        }
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingContext;

#[cfg(test)]
mod recording {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;
    use crate::database_ops::stadia::tables::TableName;

    #[derive(Debug, Clone)]
    pub struct Write {
        pub table: TableName,
        pub key: String,
        pub has_value: bool,
        pub options: UpdateOptions,
    }

    /// In-memory context that remembers every update in order.
    #[derive(Default)]
    pub struct RecordingContext {
        values: RefCell<HashMap<(TableName, String), serde_json::Value>>,
        writes: RefCell<Vec<Write>>,
    }

    impl RecordingContext {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert<T: TableDef>(&self, key: &T::Key, value: &T::Value) {
            self.values.borrow_mut().insert(
                (T::NAME, key.to_string()),
                serde_json::to_value(value).unwrap(),
            );
        }

        pub fn writes(&self) -> Vec<Write> {
            self.writes.borrow().clone()
        }

        pub fn written_keys(&self, table: TableName) -> Vec<String> {
            self.writes
                .borrow()
                .iter()
                .filter(|w| w.table == table)
                .map(|w| w.key.clone())
                .collect()
        }
    }

    impl RequestContext for RecordingContext {
        fn request_timestamp(&self) -> i64 {
            1_600_000_000_000
        }

        fn get_dependency<T: TableDef>(&self, key: &T::Key) -> Result<T::Value, StadiaError> {
            self.values
                .borrow()
                .get(&(T::NAME, key.to_string()))
                .map(|value| serde_json::from_value(value.clone()).unwrap())
                .ok_or_else(|| StadiaError::DependencyMissing {
                    table: T::NAME,
                    key: key.to_string(),
                })
        }

        fn update<T: TableDef>(
            &self,
            key: &T::Key,
            value: Option<&T::Value>,
            options: UpdateOptions,
        ) -> Result<bool, StadiaError> {
            self.writes.borrow_mut().push(Write {
                table: T::NAME,
                key: key.to_string(),
                has_value: value.is_some(),
                options,
            });
            if let Some(value) = value {
                self.insert::<T>(key, value);
            }
            Ok(true)
        }
    }
}
