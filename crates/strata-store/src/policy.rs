use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::PolicyState;

impl Database {
    /// Load the persisted policy, if one was ever saved.
    pub fn load_policy(&self) -> Result<Option<PolicyState>> {
        let document: Option<String> = self
            .conn()
            .query_row("SELECT document FROM policy WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match document {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    pub fn save_policy(&self, policy: &PolicyState) -> Result<()> {
        let document = serde_json::to_string(policy)?;
        self.conn().execute(
            "INSERT INTO policy (id, document, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at",
            params![document, policy.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }
}
