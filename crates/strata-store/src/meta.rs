use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

const SHARD_COUNT_KEY: &str = "shard_count";

impl Database {
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM node_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO node_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Pin the data directory to a shard count.
    ///
    /// The first call records `configured`; later calls fail with
    /// [`StoreError::ShardCountMismatch`] if it differs. Stored shard numbers
    /// are only meaningful for the count they were computed with.
    pub fn ensure_shard_count(&self, configured: u32) -> Result<()> {
        match self.get_meta(SHARD_COUNT_KEY)? {
            Some(raw) => {
                let persisted: u32 = raw.parse().map_err(|_| {
                    StoreError::Migration(format!("corrupt persisted shard count '{raw}'"))
                })?;
                if persisted != configured {
                    return Err(StoreError::ShardCountMismatch {
                        persisted,
                        configured,
                    });
                }
                Ok(())
            }
            None => {
                tracing::info!(shard_count = configured, "recording shard count");
                self.set_meta(SHARD_COUNT_KEY, &configured.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_pinned() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_shard_count(1024).unwrap();
        db.ensure_shard_count(1024).unwrap();

        match db.ensure_shard_count(512) {
            Err(StoreError::ShardCountMismatch {
                persisted,
                configured,
            }) => {
                assert_eq!(persisted, 1024);
                assert_eq!(configured, 512);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }
}
