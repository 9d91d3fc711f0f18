use super::{Database, DbResult};
use crate::config::AppSettings;

const SETTINGS_KEY: &str = "settings";

/// Get SQL for creating app_state table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS app_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "
}

impl Database {
    pub async fn get_app_state(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT value FROM app_state WHERE key = ?1", turso::params![key])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub async fn set_app_state(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = ?2",
            turso::params![key, value],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_app_state(&self, key: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM app_state WHERE key = ?1", turso::params![key])
            .await?;
        Ok(())
    }

    /// Stored settings, or the defaults when none were saved.
    pub async fn load_settings(&self) -> DbResult<AppSettings> {
        match self.get_app_state(SETTINGS_KEY).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(AppSettings::default()),
        }
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> DbResult<()> {
        let json = serde_json::to_string(settings)?;
        self.set_app_state(SETTINGS_KEY, &json).await
    }
}
