use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;

/// Key of the per-job deadline setting, in seconds.
pub const JOB_TIMEOUT_KEY: &str = "timeout_job_seconds";

/// Runtime-tunable key/value settings.
#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ServerError> {
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ServerError> {
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![key, value, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<(String, String)>, ServerError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Job deadline override. Unparseable or non-positive values are ignored.
    pub async fn job_timeout_secs(&self) -> Result<Option<u64>, ServerError> {
        let raw = self.get(JOB_TIMEOUT_KEY).await?;
        Ok(raw.and_then(|v| match v.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Some(secs),
            _ => {
                tracing::warn!("[Settings] Ignoring invalid {} value '{}'", JOB_TIMEOUT_KEY, v);
                None
            }
        }))
    }
}
