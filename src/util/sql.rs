//! Composable SQL fragments with bound parameters.
//!
//! A fragment is a list of literal text pieces interleaved with values, so
//! `strings.len() == values.len() + 1` always holds. Values are only ever sent
//! to SQLite as bound parameters; identifiers go through [`quote_identifier`].

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Scalars map to their SQL counterparts; arrays and objects are bound as JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(i) => SqlValue::Integer(i),
            Err(_) => SqlValue::Text(value.to_string()),
        }
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        SqlValue::from_json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Double-quoted SQLite identifier with embedded quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sql {
    strings: Vec<String>,
    values: Vec<SqlValue>,
}

impl Default for Sql {
    fn default() -> Self {
        Self::new()
    }
}

impl Sql {
    pub fn new() -> Self {
        Self {
            strings: vec![String::new()],
            values: Vec::new(),
        }
    }

    pub fn raw(text: &str) -> Self {
        Self::new().push(text)
    }

    /// Append literal SQL text.
    pub fn push(mut self, text: &str) -> Self {
        if let Some(last) = self.strings.last_mut() {
            last.push_str(text);
        }
        self
    }

    /// Append a bound parameter.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.values.push(value.into());
        self.strings.push(String::new());
        self
    }

    /// Append a quoted identifier.
    pub fn ident(self, name: &str) -> Self {
        let quoted = quote_identifier(name);
        self.push(&quoted)
    }

    /// Splice another fragment in place, flattening its text and values.
    pub fn append(mut self, other: Sql) -> Self {
        let mut strings = other.strings.into_iter();
        if let (Some(first), Some(last)) = (strings.next(), self.strings.last_mut()) {
            last.push_str(&first);
        }
        for (value, text) in other.values.into_iter().zip(strings) {
            self.values.push(value);
            self.strings.push(text);
        }
        self
    }

    pub fn join<I>(parts: I, separator: &str) -> Sql
    where
        I: IntoIterator<Item = Sql>,
    {
        let mut out = Sql::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out = out.push(separator);
            }
            out = out.append(part);
        }
        out
    }

    /// Query text with `?` placeholders.
    pub fn text(&self) -> String {
        self.strings.join("?")
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn params(&self) -> Vec<&dyn ToSql> {
        self.values.iter().map(|v| v as &dyn ToSql).collect()
    }
}

impl fmt::Display for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text().trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splices_fragments_without_losing_values() {
        let filter = Sql::raw("name = ").bind("Stadia").push(" and n > ").bind(3i64);
        let query = Sql::raw("select json from ")
            .ident("Game")
            .push(" where ")
            .append(filter)
            .push(" limit ")
            .bind(10i64);

        assert_eq!(
            query.text(),
            r#"select json from "Game" where name = ? and n > ? limit ?"#
        );
        assert_eq!(
            query.values(),
            &[
                SqlValue::Text("Stadia".into()),
                SqlValue::Integer(3),
                SqlValue::Integer(10)
            ]
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(
            Sql::new().ident("Sku.value.name::indexed").text(),
            r#""Sku.value.name::indexed""#
        );
    }

    #[test]
    fn json_containers_bind_as_text() {
        assert_eq!(
            SqlValue::from_json(&json!(["a", 1])),
            SqlValue::Text(r#"["a",1]"#.into())
        );
        assert_eq!(SqlValue::from_json(&json!(42)), SqlValue::Integer(42));
    }

    #[test]
    fn join_separates_parts() {
        let joined = Sql::join([Sql::raw("a = ").bind(1i64), Sql::raw("b = ").bind(2i64)], " and ");
        assert_eq!(joined.text(), "a = ? and b = ?");
        assert_eq!(joined.values().len(), 2);
    }
}
