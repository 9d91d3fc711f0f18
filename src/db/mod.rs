//! Local persistence on turso: transfer history and app state

use std::path::Path;
use tokio::sync::Mutex;
use turso::{Builder, Connection};

pub type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub mod app_state;
pub mod history;

/// One local database. The connection is serialized behind a mutex; turso
/// connections are not safe to drive concurrently.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and its tables.
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        let path = db_path
            .to_str()
            .ok_or("database path is not valid UTF-8")?;
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        conn.execute_batch(history::get_table_sql()).await?;
        conn.execute_batch(app_state::get_table_sql()).await?;

        log::info!("database_opened: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
