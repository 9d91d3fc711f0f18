use super::{Database, DbResult};
use crate::transfer::{TransferRecord, TransferStatus};

/// Get SQL for creating the transfer history table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS transfer_history (
        id TEXT PRIMARY KEY,
        bucket_id INTEGER NOT NULL,
        filename TEXT NOT NULL,
        object_key TEXT NOT NULL,
        status TEXT NOT NULL,
        url TEXT,
        submitted_at INTEGER NOT NULL,
        finished_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_history_submitted ON transfer_history(submitted_at);
    "
}

// ============ Transfer History Functions ============

impl Database {
    /// Insert or replace a finished transfer. Status is stored as the same
    /// JSON the progress events carry.
    pub async fn save_transfer(&self, record: &TransferRecord) -> DbResult<()> {
        let status = serde_json::to_string(&record.status)?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO transfer_history
             (id, bucket_id, filename, object_key, status, url, submitted_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET status = ?5, url = ?6, finished_at = ?8",
            turso::params![
                record.id.clone(),
                record.bucket_id,
                record.filename.clone(),
                record.key.clone(),
                status,
                record.url.clone(),
                record.submitted_at,
                now,
            ],
        )
        .await?;
        Ok(())
    }

    /// All persisted transfers, oldest submission first.
    pub async fn list_transfers(&self) -> DbResult<Vec<TransferRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, bucket_id, filename, object_key, status, url, submitted_at
                 FROM transfer_history ORDER BY submitted_at ASC, id ASC",
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let status_json: String = row.get(4)?;
            let status: TransferStatus = serde_json::from_str(&status_json)?;
            records.push(TransferRecord {
                id: row.get(0)?,
                bucket_id: row.get(1)?,
                filename: row.get(2)?,
                key: row.get(3)?,
                status,
                url: row.get(5)?,
                submitted_at: row.get(6)?,
            });
        }
        Ok(records)
    }

    pub async fn delete_transfer(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM transfer_history WHERE id = ?1", turso::params![id])
            .await?;
        Ok(())
    }

    pub async fn clear_transfers(&self) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM transfer_history", ()).await?;
        Ok(())
    }
}
