use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::platform::{HealthStatus, PlatformExecutor, QueryExecutor, HISTORY_LIMIT};
use crate::retry::{classify_error, with_retry_when, FailureClass, RetryConfig};
use crate::schema::Platform;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

pub(crate) fn checked_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(EngineError::InvalidParams(format!("invalid table name '{}'", name)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub connection_string: String,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_retries() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    400
}

impl DatabaseConfig {
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Where a connection string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(String),
}

/// `sqlite://` URLs or bare file paths. Other schemes are rejected.
pub fn parse_connection_string(raw: &str) -> Result<SqliteTarget> {
    let raw = raw.trim();
    let path = if let Some(rest) = raw.strip_prefix("sqlite:///") {
        rest
    } else if let Some(rest) = raw.strip_prefix("sqlite://") {
        rest
    } else if raw.contains("://") {
        return Err(EngineError::Config(format!(
            "unsupported database URL '{}': only sqlite is available",
            raw
        )));
    } else {
        raw
    };
    match path {
        "" | ":memory:" => Ok(SqliteTarget::Memory),
        p => Ok(SqliteTarget::File(p.to_string())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub query: String,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub duration_ms: f64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    fn failed(query: &str, error: String, duration_ms: f64, attempts: u32) -> Self {
        Self {
            success: false,
            query: query.to_string(),
            rows: Vec::new(),
            row_count: 0,
            duration_ms,
            attempts,
            error: Some(error),
        }
    }
}

/// SQLite adapter. Blocking rusqlite calls run on the blocking pool.
pub struct DatabaseExecutor {
    config: DatabaseConfig,
    conn: Option<Arc<Mutex<Connection>>>,
    history: Vec<QueryOutcome>,
}

impl DatabaseExecutor {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        parse_connection_string(&config.connection_string)?;
        Ok(Self {
            config,
            conn: None,
            history: Vec::new(),
        })
    }

    pub fn history(&self) -> &[QueryOutcome] {
        &self.history
    }

    async fn run_blocking(&self, sql: String, params: Value) -> Result<(Vec<Map<String, Value>>, usize)> {
        let conn = self
            .conn
            .as_ref()
            .map(Arc::clone)
            .ok_or(EngineError::NotStarted(Platform::Database))?;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| EngineError::Database("connection mutex poisoned".to_string()))?;
            run_statement(&guard, &sql, &params)
        })
        .await
        .map_err(|e| EngineError::Database(format!("query task failed: {}", e)))?
    }
}

fn open(target: &SqliteTarget) -> Result<Connection> {
    let conn = match target {
        SqliteTarget::Memory => Connection::open_in_memory()?,
        SqliteTarget::File(path) => Connection::open(path)?,
    };
    conn.busy_timeout(std::time::Duration::from_millis(500))?;
    Ok(conn)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(general_purpose::STANDARD.encode(b)),
    }
}

/// Rows for statements that return columns, otherwise the affected-row count.
fn run_statement(conn: &Connection, sql: &str, params: &Value) -> Result<(Vec<Map<String, Value>>, usize)> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let named: Vec<(String, SqlValue)> = match params {
        Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| {
                let key = if k.starts_with([':', '@', '$']) { k.clone() } else { format!(":{}", k) };
                (key, to_sql_value(v))
            })
            .collect(),
        _ => Vec::new(),
    };
    let positional: Vec<SqlValue> = match params {
        Value::Array(items) => items.iter().map(to_sql_value).collect(),
        Value::Null | Value::Object(_) => Vec::new(),
        scalar => vec![to_sql_value(scalar)],
    };
    let named_refs: Vec<(&str, &dyn ToSql)> = named.iter().map(|(k, v)| (k.as_str(), v as &dyn ToSql)).collect();

    if columns.is_empty() {
        let changed = if named_refs.is_empty() {
            stmt.execute(rusqlite::params_from_iter(positional.iter()))?
        } else {
            stmt.execute(named_refs.as_slice())?
        };
        return Ok((Vec::new(), changed));
    }

    let mut rows = if named_refs.is_empty() {
        stmt.query(rusqlite::params_from_iter(positional.iter()))?
    } else {
        stmt.query(named_refs.as_slice())?
    };
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    let count = out.len();
    Ok((out, count))
}

#[async_trait]
impl PlatformExecutor for DatabaseExecutor {
    fn platform(&self) -> Platform {
        Platform::Database
    }

    async fn start(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let target = parse_connection_string(&self.config.connection_string)?;
        info!("[DB] Opening {:?}", target);
        let conn = tokio::task::spawn_blocking(move || open(&target))
            .await
            .map_err(|e| EngineError::Database(format!("open task failed: {}", e)))??;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }

    async fn health_check(&mut self) -> HealthStatus {
        if self.conn.is_none() {
            return match parse_connection_string(&self.config.connection_string) {
                Ok(_) => HealthStatus::ready(Platform::Database),
                Err(e) => HealthStatus::unavailable(Platform::Database, e.to_string()),
            };
        }
        let check = self.execute_query("SELECT 1", &Value::Null).await;
        match check.error {
            None => HealthStatus::ready(Platform::Database),
            Some(e) => HealthStatus::unavailable(Platform::Database, e),
        }
    }

    fn queries(&mut self) -> Option<&mut dyn QueryExecutor> {
        Some(self)
    }
}

#[async_trait]
impl QueryExecutor for DatabaseExecutor {
    async fn execute_query(&mut self, sql: &str, params: &Value) -> QueryOutcome {
        let started = Instant::now();
        let retry = RetryConfig::fixed(self.config.max_retries, self.config.retry_delay_ms);
        let this = &*self;
        let (result, attempts) = with_retry_when(
            &retry,
            "db query",
            || this.run_blocking(sql.to_string(), params.clone()),
            |r| matches!(r, Err(e) if classify_error(&e.to_string()) == FailureClass::Busy),
        )
        .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match result {
            Ok((rows, row_count)) => QueryOutcome {
                success: true,
                query: sql.to_string(),
                rows,
                row_count,
                duration_ms,
                attempts,
                error: None,
            },
            Err(e) => {
                warn!("[DB] Query failed: {}", e);
                QueryOutcome::failed(sql, e.to_string(), duration_ms, attempts)
            }
        };
        if self.history.len() >= HISTORY_LIMIT {
            let excess = self.history.len() + 1 - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        self.history.push(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_db() -> DatabaseExecutor {
        let mut db = DatabaseExecutor::new(DatabaseConfig::new("sqlite:///:memory:")).unwrap();
        db.start().await.unwrap();
        db.execute_query("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, active INTEGER)", &Value::Null)
            .await;
        db.execute_query(
            "INSERT INTO users (email, active) VALUES (?1, ?2), (?3, ?4)",
            &json!(["a@x.io", true, "b@x.io", false]),
        )
        .await;
        db
    }

    #[test]
    fn connection_strings() {
        assert_eq!(parse_connection_string("sqlite:///:memory:").unwrap(), SqliteTarget::Memory);
        assert_eq!(
            parse_connection_string("sqlite:///data/app.db").unwrap(),
            SqliteTarget::File("data/app.db".into())
        );
        assert_eq!(
            parse_connection_string("sqlite:////var/app.db").unwrap(),
            SqliteTarget::File("/var/app.db".into())
        );
        assert_eq!(parse_connection_string("./local.db").unwrap(), SqliteTarget::File("./local.db".into()));
        assert!(matches!(
            parse_connection_string("postgresql://u@h/db"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(checked_identifier("users").is_ok());
        assert!(checked_identifier("users; DROP TABLE x").is_err());
    }

    #[tokio::test]
    async fn named_params_and_row_maps() {
        let mut db = memory_db().await;
        let outcome = db
            .execute_query("SELECT id, email FROM users WHERE email = :email", &json!({ "email": "b@x.io" }))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.row_count, 1);
        assert_eq!(outcome.rows[0]["email"], "b@x.io");
        assert_eq!(outcome.rows[0]["id"], 2);
    }

    #[tokio::test]
    async fn errors_are_reported_not_raised() {
        let mut db = memory_db().await;
        let outcome = db.execute_query("SELECT * FROM nope", &Value::Null).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no such table"));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(db.history().len(), 3);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let mut db = memory_db().await;
        for i in 0..HISTORY_LIMIT + 5 {
            db.execute_query("SELECT :n AS n", &json!({ "n": i })).await;
        }
        assert_eq!(db.history().len(), HISTORY_LIMIT);
        let newest = db.history().last().unwrap();
        assert_eq!(newest.rows[0]["n"], (HISTORY_LIMIT + 4) as i64);
    }

    #[tokio::test]
    async fn schema_and_count_checks() {
        let mut db = memory_db().await;
        let report = db
            .validate_schema("users", &["id".to_string(), "email".to_string()])
            .await;
        assert_eq!(report["success"], true);
        let report = db.validate_schema("users", &["phone".to_string()]).await;
        assert_eq!(report["success"], false);
        assert_eq!(report["missing_columns"], json!(["phone"]));

        let count = db.check_table_count("users", 2).await;
        assert_eq!(count["count"], 2);
        assert_eq!(count["validation_passed"], true);
        let count = db.check_table_count("users", 3).await;
        assert_eq!(count["validation_passed"], false);
    }

    #[tokio::test]
    async fn file_database_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let config = DatabaseConfig::new(path.to_str().unwrap());

        let mut db = DatabaseExecutor::new(config.clone()).unwrap();
        db.start().await.unwrap();
        db.execute_query("CREATE TABLE t (v TEXT)", &Value::Null).await;
        db.execute_query("INSERT INTO t VALUES ('kept')", &Value::Null).await;
        db.stop().await.unwrap();

        let mut again = DatabaseExecutor::new(config).unwrap();
        again.start().await.unwrap();
        let outcome = again.execute_query("SELECT v FROM t", &Value::Null).await;
        assert_eq!(outcome.rows[0]["v"], "kept");
    }

    #[tokio::test]
    async fn query_before_start_fails() {
        let mut db = DatabaseExecutor::new(DatabaseConfig::new("sqlite://")).unwrap();
        let outcome = db.execute_query("SELECT 1", &Value::Null).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not started"));
    }
}
