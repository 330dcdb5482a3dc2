use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::ColumnInfo;

/// Failure of a single statement. `Database` carries the engine's own message.
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("{0}")]
    Database(String),
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Rows returned by one statement, columns in select-list order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render as a list of objects in column order, at most `max_rows` of them.
    pub fn render(&self, max_rows: usize) -> String {
        if self.is_empty() {
            return "[]".to_string();
        }

        let shown = self.rows.len().min(max_rows);
        let objects = self.rows[..shown]
            .iter()
            .map(|row| {
                let fields = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| format!("{}: {}", Value::from(column.as_str()), value))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{}}}", fields)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let hidden = self.rows.len() - shown;
        if hidden > 0 {
            format!("[{}] ... ({} more rows)", objects, hidden)
        } else {
            format!("[{}]", objects)
        }
    }
}

/// Runs SQL against the configured database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryRows, SqlError>;

    /// Column metadata for `table`; empty when the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>>;
}

pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    /// Open a connection for `dialect` from a descriptor: `sqlite:///path/to.db`,
    /// `sqlite::memory:`, or a bare file path. The file must already exist.
    pub fn connect(dialect: &str, descriptor: &str) -> Result<Self> {
        if !dialect.trim().eq_ignore_ascii_case("sqlite") {
            anyhow::bail!("Unsupported SQL dialect '{}'", dialect);
        }

        let descriptor = descriptor.trim();
        let conn = if descriptor == "sqlite::memory:" || descriptor == ":memory:" {
            Connection::open_in_memory().context("Failed to open in-memory database")?
        } else {
            // sqlite:///relative.db, sqlite:////abs/path.db
            let path = descriptor
                .strip_prefix("sqlite:///")
                .or_else(|| descriptor.strip_prefix("sqlite://"))
                .unwrap_or(descriptor)
                .to_string();

            if path.is_empty() {
                anyhow::bail!("Connection string has no database path");
            }
            if let Some((scheme, _)) = path.split_once("://") {
                anyhow::bail!("Unsupported connection scheme '{}'", scheme);
            }

            Connection::open_with_flags(
                Path::new(&path),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open database at {}", path))?
        };

        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn run_query(conn: &Connection, sql: &str) -> rusqlite::Result<QueryRows> {
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(to_json(row.get_ref(idx)?));
            }
            rows.push(values);
        }

        Ok(QueryRows { columns, rows })
    }

    fn table_info(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = conn.prepare(&format!(
            "PRAGMA table_info(\"{}\")",
            table.replace('"', "\"\"")
        ))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get::<_, String>(1)?,
                    data_type: row.get::<_, String>(2)?,
                    nullable: row.get::<_, i64>(3)? == 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> std::result::Result<QueryRows, SqlError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| SqlError::Unavailable(format!("Database lock poisoned: {}", e)))?;
            Self::run_query(&conn, &sql).map_err(|e| SqlError::Database(e.to_string()))
        })
        .await
        .map_err(|e| SqlError::Unavailable(e.to_string()))?
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let conn = Arc::clone(&self.conn);
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))?;
            Self::table_info(&conn, &table)
        })
        .await
        .context("Schema introspection task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> SqliteExecutor {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE produtos (id INTEGER PRIMARY KEY, nome TEXT NOT NULL, preco REAL NOT NULL, foto BLOB);
             INSERT INTO produtos (nome, preco, foto) VALUES ('Laptop Pro', 4500.0, x'0102');
             INSERT INTO produtos (nome, preco, foto) VALUES ('Mouse Gamer', 250.0, NULL);",
        )
        .unwrap();
        SqliteExecutor::from_connection(conn)
    }

    #[tokio::test]
    async fn execute_returns_columns_in_select_order() {
        let rows = executor()
            .execute("SELECT preco, nome FROM produtos ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["preco", "nome"]);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(
            rows.render(10),
            r#"[{"preco": 4500.0, "nome": "Laptop Pro"}, {"preco": 250.0, "nome": "Mouse Gamer"}]"#
        );
    }

    #[tokio::test]
    async fn blobs_and_nulls_render_as_placeholders() {
        let rows = executor()
            .execute("SELECT foto FROM produtos ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.render(10), r#"[{"foto": "<blob 2 bytes>"}, {"foto": null}]"#);
    }

    #[tokio::test]
    async fn render_truncates_with_note() {
        let rows = executor()
            .execute("SELECT id FROM produtos ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.render(1), r#"[{"id": 1}] ... (1 more rows)"#);
    }

    #[tokio::test]
    async fn empty_result_renders_as_empty_list() {
        let rows = executor()
            .execute("SELECT id FROM produtos WHERE preco > 100000")
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(rows.render(10), "[]");
    }

    #[tokio::test]
    async fn syntax_error_keeps_engine_message() {
        let err = executor()
            .execute("SELEC nome FROM produtos")
            .await
            .unwrap_err();
        match err {
            SqlError::Database(message) => assert!(message.contains("syntax error")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn describe_reports_columns_and_nullability() {
        let columns = executor().describe_table("produtos").await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "nome", "preco", "foto"]);
        assert!(!columns[1].nullable);
        assert!(columns[3].nullable);

        let missing = executor().describe_table("nope").await.unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn connect_rejects_other_dialects_and_schemes() {
        assert!(SqliteExecutor::connect("oracle", "sqlite::memory:").is_err());
        assert!(SqliteExecutor::connect("sqlite", "postgres://localhost/db").is_err());
        assert!(SqliteExecutor::connect("SQLite", "sqlite::memory:").is_ok());
    }

    #[test]
    fn connect_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.db");
        assert!(SqliteExecutor::connect("sqlite", missing.to_str().unwrap()).is_err());

        let path = dir.path().join("present.db");
        Connection::open(&path).unwrap();
        let descriptor = format!("sqlite:///{}", path.display());
        assert!(SqliteExecutor::connect("sqlite", &descriptor).is_ok());
    }
}
