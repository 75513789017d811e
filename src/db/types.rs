use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// A value bound as a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    /// Signed 64-bit integer (BIGINT)
    Int64(i64),
    /// Unsigned 64-bit integer, stored as BIGINT
    Uint64(u64),
    /// DOUBLE PRECISION
    Float64(f64),
    Text(String),
    /// TIMESTAMPTZ
    Timestamp(DateTime<Utc>),
    /// JSONB
    Json(JsonValue),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// `Text` for `Some`, `Null` for `None`.
    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(v) => DbValue::Text(v.to_string()),
            None => DbValue::Null,
        }
    }

    pub fn opt_u64(value: Option<u64>) -> Self {
        match value {
            Some(v) => DbValue::Uint64(v),
            None => DbValue::Null,
        }
    }

    pub fn opt_timestamp(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(v) => DbValue::Timestamp(v),
            None => DbValue::Null,
        }
    }
}

/// A write executed inside [`DbPool::execute_transaction`](super::DbPool::execute_transaction).
#[derive(Debug, Clone)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT DO UPDATE, or DO NOTHING when `update_columns` is empty
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        conflict_columns: Vec<String>,
        update_columns: Vec<String>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
    },
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
    Delete {
        table: String,
        where_clause: WhereClause,
    },
}

/// WHERE clause for UPDATE and DELETE operations.
#[derive(Debug, Clone)]
pub enum WhereClause {
    /// column = value
    Eq(String, DbValue),
    /// Raw SQL condition; placeholders must continue the numbering of the SET list
    Raw {
        condition: String,
        params: Vec<DbValue>,
    },
}
