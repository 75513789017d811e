use bytes::BytesMut;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use super::error::DbError;
use super::types::{DbOperation, DbValue, WhereClause};

pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    pub async fn new(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(DbError::BuildError)?;

        let _conn = pool.get().await?;
        tracing::info!("Database connection pool created (max_size={})", max_size);

        Ok(Self { pool })
    }

    /// Runs every operation inside one transaction. Any failure rolls the
    /// whole batch back; nothing becomes visible unless every statement succeeds.
    pub async fn execute_transaction(&self, operations: Vec<DbOperation>) -> Result<u64, DbError> {
        if operations.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        let mut affected = 0u64;

        for op in operations {
            let (sql, params) = build_operation_sql(op);
            let params_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

            match transaction.execute(&sql, &params_refs[..]).await {
                Ok(n) => affected += n,
                Err(e) => {
                    let db_err: DbError = e.into();
                    tracing::error!("SQL execution failed, rolling back\n  SQL: {}\n  Error: {}", sql, db_err);
                    // Dropping the transaction without commit rolls it back.
                    return Err(db_err);
                }
            }
        }

        transaction.commit().await?;
        Ok(affected)
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        super::migrations::run(&self.pool).await
    }

    pub async fn query(&self, query: &str, params: &[DbValue]) -> Result<Vec<tokio_postgres::Row>, DbError> {
        let params = convert_values_to_params(params);
        let params_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let client = self.pool.get().await?;
        let rows = client.query(query, &params_refs[..]).await?;
        Ok(rows)
    }

    pub async fn query_opt(
        &self,
        query: &str,
        params: &[DbValue],
    ) -> Result<Option<tokio_postgres::Row>, DbError> {
        let params = convert_values_to_params(params);
        let params_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let client = self.pool.get().await?;
        let row = client.query_opt(query, &params_refs[..]).await?;
        Ok(row)
    }

    /// Executes a single statement and returns the affected-row count.
    pub async fn execute(&self, query: &str, params: &[DbValue]) -> Result<u64, DbError> {
        let params = convert_values_to_params(params);
        let params_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let client = self.pool.get().await?;
        let n = client.execute(query, &params_refs[..]).await?;
        Ok(n)
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("DbPool")
            .field("size", &status.size)
            .field("available", &status.available)
            .finish()
    }
}

#[derive(Debug)]
enum SqlParam {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(v) => v.to_sql(ty, out),
            SqlParam::Int64(v) => v.to_sql(ty, out),
            SqlParam::Float64(v) => v.to_sql(ty, out),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::Timestamp(v) => v.to_sql(ty, out),
            SqlParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <bool as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <f64 as ToSql>::accepts(ty)
            || <String as ToSql>::accepts(ty)
            || <DateTime<Utc> as ToSql>::accepts(ty)
            || <serde_json::Value as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn convert_db_value(value: &DbValue) -> SqlParam {
    match value {
        DbValue::Null => SqlParam::Null,
        DbValue::Bool(v) => SqlParam::Bool(*v),
        DbValue::Int64(v) => SqlParam::Int64(*v),
        DbValue::Uint64(v) => SqlParam::Int64(*v as i64),
        DbValue::Float64(v) => SqlParam::Float64(*v),
        DbValue::Text(v) => SqlParam::Text(v.clone()),
        DbValue::Timestamp(v) => SqlParam::Timestamp(*v),
        DbValue::Json(v) => SqlParam::Json(v.clone()),
    }
}

fn convert_values_to_params(values: &[DbValue]) -> Vec<SqlParam> {
    values.iter().map(convert_db_value).collect()
}

fn build_operation_sql(op: DbOperation) -> (String, Vec<SqlParam>) {
    match op {
        DbOperation::Upsert {
            table,
            columns,
            values,
            conflict_columns,
            update_columns,
        } => build_upsert_sql(&table, &columns, &values, &conflict_columns, &update_columns),
        DbOperation::Insert {
            table,
            columns,
            values,
        } => build_insert_sql(&table, &columns, &values),
        DbOperation::Update {
            table,
            set_columns,
            where_clause,
        } => build_update_sql(&table, &set_columns, &where_clause),
        DbOperation::Delete { table, where_clause } => build_delete_sql(&table, &where_clause),
    }
}

/// Wrap a column name in double quotes to handle reserved keywords.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

fn quote_cols(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

fn placeholders(count: usize) -> String {
    (1..=count).map(|i| format!("${}", i)).collect::<Vec<_>>().join(", ")
}

fn build_insert_sql(table: &str, columns: &[String], values: &[DbValue]) -> (String, Vec<SqlParam>) {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        quote_cols(columns),
        placeholders(values.len())
    );
    (sql, convert_values_to_params(values))
}

fn build_upsert_sql(
    table: &str,
    columns: &[String],
    values: &[DbValue],
    conflict_columns: &[String],
    update_columns: &[String],
) -> (String, Vec<SqlParam>) {
    let cols = quote_cols(columns);
    let conflict_cols = quote_cols(conflict_columns);

    let sql = if update_columns.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            table,
            cols,
            placeholders(values.len()),
            conflict_cols
        )
    } else {
        let updates: Vec<String> = update_columns
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            table,
            cols,
            placeholders(values.len()),
            conflict_cols,
            updates.join(", ")
        )
    };

    (sql, convert_values_to_params(values))
}

fn build_update_sql(
    table: &str,
    set_columns: &[(String, DbValue)],
    where_clause: &WhereClause,
) -> (String, Vec<SqlParam>) {
    let mut params = Vec::new();
    let mut param_idx = 1;

    let sets: Vec<String> = set_columns
        .iter()
        .map(|(col, val)| {
            params.push(convert_db_value(val));
            let s = format!("{} = ${}", quote_ident(col), param_idx);
            param_idx += 1;
            s
        })
        .collect();

    let where_str = build_where_sql(where_clause, &mut params, &mut param_idx);

    let sql = format!("UPDATE {} SET {} WHERE {}", table, sets.join(", "), where_str);
    (sql, params)
}

fn build_delete_sql(table: &str, where_clause: &WhereClause) -> (String, Vec<SqlParam>) {
    let mut params = Vec::new();
    let mut param_idx = 1;

    let where_str = build_where_sql(where_clause, &mut params, &mut param_idx);

    let sql = format!("DELETE FROM {} WHERE {}", table, where_str);
    (sql, params)
}

fn build_where_sql(
    where_clause: &WhereClause,
    params: &mut Vec<SqlParam>,
    param_idx: &mut usize,
) -> String {
    match where_clause {
        WhereClause::Eq(col, val) => {
            params.push(convert_db_value(val));
            let s = format!("{} = ${}", quote_ident(col), *param_idx);
            *param_idx += 1;
            s
        }
        WhereClause::Raw { condition, params: raw_params } => {
            for p in raw_params {
                params.push(convert_db_value(p));
                *param_idx += 1;
            }
            condition.clone()
        }
    }
}
