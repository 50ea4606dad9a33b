//! Column encoding helpers and the WHERE-clause builder used by finds.

use chrono::{DateTime, SecondsFormat, Utc};
use parley_shared::query::{Comparison, SortOrder};
use parley_shared::types::MessageId;
use rusqlite::types::{Type, Value};
use serde::de::DeserializeOwned;

/// Fixed-width RFC 3339 so that text comparison in SQL is time comparison.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn message_id(idx: usize, raw: i64) -> rusqlite::Result<MessageId> {
    u64::try_from(raw)
        .map(MessageId)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

/// SQLite integers are signed. Ids past `i64::MAX` saturate so that a
/// range bound never wraps into the negatives.
pub(crate) fn id_value(id: MessageId) -> i64 {
    i64::try_from(id.0).unwrap_or(i64::MAX)
}

/// Converts filter operands to SQL values.
pub(crate) trait SqlOperand {
    fn to_value(&self) -> Value;
}

impl SqlOperand for MessageId {
    fn to_value(&self) -> Value {
        Value::Integer(id_value(*self))
    }
}

impl SqlOperand for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::Text(ts(self))
    }
}

/// Accumulates `AND`-joined conditions with positional parameters.
#[derive(Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Filter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn eq(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        self.clauses.push(format!("{column} = ?"));
        self.values.push(value.into());
        self
    }

    pub(crate) fn eq_opt<V: Into<Value>>(&mut self, column: &str, value: Option<V>) -> &mut Self {
        if let Some(v) = value {
            self.eq(column, v);
        }
        self
    }

    pub(crate) fn compare<T: SqlOperand>(
        &mut self,
        column: &str,
        comparison: Option<&Comparison<T>>,
    ) -> &mut Self {
        if let Some(c) = comparison {
            let (op, operand) = c.sql_parts();
            self.clauses.push(format!("{column} {op} ?"));
            self.values.push(operand.to_value());
        }
        self
    }

    pub(crate) fn raw(&mut self, clause: &str, values: impl IntoIterator<Item = Value>) -> &mut Self {
        self.clauses.push(clause.to_string());
        self.values.extend(values);
        self
    }

    pub(crate) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(crate) fn values(&self) -> &[Value] {
        &self.values
    }

    pub(crate) fn params(&self) -> rusqlite::ParamsFromIter<std::slice::Iter<'_, Value>> {
        rusqlite::params_from_iter(self.values.iter())
    }
}

pub(crate) fn order_sql(column: &str, order: Option<SortOrder>) -> String {
    format!(" ORDER BY {column} {}", order.unwrap_or_default().sql())
}

pub(crate) fn limit_sql(limit: Option<u32>) -> String {
    limit.map(|l| format!(" LIMIT {l}")).unwrap_or_default()
}
