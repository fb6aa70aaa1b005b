//! Database layer for Grove

mod connection;
mod migrations;
mod repository;

use libsql::{Connection, Value};
use std::str::FromStr;

use crate::error::{Error, Result};

pub use connection::Database;
pub use repository::{LibSqlNoteRepository, NoteRepository};

pub(crate) use repository::would_create_cycle;

pub(crate) fn nullable_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn nullable_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

/// Parse an id column, reporting the column on failure.
pub(crate) fn parse_column<T: FromStr>(raw: &str, column: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid {column} value: {raw}")))
}

pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit when `result` is Ok, otherwise roll back; passes `result` through.
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}
