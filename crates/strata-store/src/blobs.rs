use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use strata_shared::{Cid, GuildId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{BlobOrigin, BlobRecord, ReplicaEntry, StoreStats};

const BLOB_COLUMNS: &str =
    "cid, size, content_type, guild, shard, origin, origin_peer, pinned, stored_at, last_accessed";

impl Database {
    pub fn insert_blob(&self, blob: &BlobRecord) -> Result<()> {
        let (origin, origin_peer) = match &blob.origin {
            BlobOrigin::Local => ("local", None),
            BlobOrigin::Replica { from } => ("replica", Some(from.as_str())),
        };
        self.conn().execute(
            "INSERT INTO blobs (cid, size, content_type, guild, shard, origin, origin_peer, pinned, stored_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                blob.cid.to_hex(),
                blob.size as i64,
                blob.content_type.as_str(),
                blob.guild.as_ref().map(GuildId::as_str),
                blob.shard,
                origin,
                origin_peer,
                blob.pinned as i32,
                blob.stored_at.to_rfc3339(),
                blob.last_accessed.to_rfc3339(),
            ],
        )?;
        for replica in &blob.replicas {
            self.upsert_replica(&blob.cid, &replica.peer_id, replica.last_verified)?;
        }
        Ok(())
    }

    /// Fetch a blob record with its replica set, or `None` if unknown.
    pub fn find_blob(&self, cid: &Cid) -> Result<Option<BlobRecord>> {
        let sql = format!("SELECT {BLOB_COLUMNS} FROM blobs WHERE cid = ?1");
        let record = self
            .conn()
            .query_row(&sql, params![cid.to_hex()], row_to_blob)
            .optional()?;

        match record {
            Some(mut record) => {
                record.replicas = self.replicas_for(cid)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn get_blob(&self, cid: &Cid) -> Result<BlobRecord> {
        self.find_blob(cid)?.ok_or(StoreError::NotFound(*cid))
    }

    pub fn list_blobs(&self) -> Result<Vec<BlobRecord>> {
        let sql = format!("SELECT {BLOB_COLUMNS} FROM blobs ORDER BY last_accessed ASC");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_blob)?;

        let mut blobs = Vec::new();
        for row in rows {
            let mut record = row?;
            record.replicas = self.replicas_for(&record.cid)?;
            blobs.push(record);
        }
        Ok(blobs)
    }

    pub fn touch_blob(&self, cid: &Cid, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE blobs SET last_accessed = ?2 WHERE cid = ?1",
            params![cid.to_hex(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    pub fn set_pinned(&self, cid: &Cid, pinned: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE blobs SET pinned = ?2 WHERE cid = ?1",
            params![cid.to_hex(), pinned as i32],
        )?;
        Ok(affected > 0)
    }

    pub fn set_origin(&self, cid: &Cid, origin: &BlobOrigin) -> Result<bool> {
        let (kind, origin_peer) = match origin {
            BlobOrigin::Local => ("local", None),
            BlobOrigin::Replica { from } => ("replica", Some(from.as_str())),
        };
        let affected = self.conn().execute(
            "UPDATE blobs SET origin = ?2, origin_peer = ?3 WHERE cid = ?1",
            params![cid.to_hex(), kind, origin_peer],
        )?;
        Ok(affected > 0)
    }

    // replicas go with it (ON DELETE CASCADE); the payload file is the caller's job
    pub fn delete_blob(&self, cid: &Cid) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM blobs WHERE cid = ?1", params![cid.to_hex()])?;
        Ok(affected > 0)
    }

    pub fn blob_stats(&self) -> Result<StoreStats> {
        let (count, total, pinned): (i64, i64, i64) = self.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(size), 0),
                    COALESCE(SUM(CASE WHEN pinned = 1 THEN size ELSE 0 END), 0)
             FROM blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreStats {
            count: count as u64,
            total_bytes: total as u64,
            pinned_bytes: pinned as u64,
        })
    }

    // -- replica sets --

    pub fn replicas_for(&self, cid: &Cid) -> Result<Vec<ReplicaEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer_id, last_verified FROM replicas WHERE cid = ?1 ORDER BY peer_id ASC",
        )?;
        let rows = stmt.query_map(params![cid.to_hex()], |row| {
            let peer_id: String = row.get(0)?;
            let verified: String = row.get(1)?;
            Ok(ReplicaEntry {
                peer_id,
                last_verified: parse_ts(&verified, 1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Insert a replica holder or refresh its verification time.
    pub fn upsert_replica(&self, cid: &Cid, peer_id: &str, verified: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO replicas (cid, peer_id, last_verified) VALUES (?1, ?2, ?3)
             ON CONFLICT(cid, peer_id) DO UPDATE SET last_verified = excluded.last_verified",
            params![cid.to_hex(), peer_id, verified.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_replica(&self, cid: &Cid, peer_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM replicas WHERE cid = ?1 AND peer_id = ?2",
            params![cid.to_hex(), peer_id],
        )?;
        Ok(affected > 0)
    }
}

fn parse_ts(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_blob(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlobRecord> {
    let cid_hex: String = row.get(0)?;
    let size: i64 = row.get(1)?;
    let content_type: String = row.get(2)?;
    let guild: Option<String> = row.get(3)?;
    let shard: u32 = row.get(4)?;
    let origin: String = row.get(5)?;
    let origin_peer: Option<String> = row.get(6)?;
    let pinned: i32 = row.get(7)?;
    let stored_str: String = row.get(8)?;
    let accessed_str: String = row.get(9)?;

    let cid = Cid::from_hex(&cid_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let content_type = content_type.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let origin = match (origin.as_str(), origin_peer) {
        ("replica", Some(from)) => BlobOrigin::Replica { from },
        _ => BlobOrigin::Local,
    };

    Ok(BlobRecord {
        cid,
        size: size as u64,
        content_type,
        guild: guild.map(GuildId),
        shard,
        origin,
        pinned: pinned != 0,
        stored_at: parse_ts(&stored_str, 8)?,
        last_accessed: parse_ts(&accessed_str, 9)?,
        replicas: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_shared::ContentType;

    fn record(payload: &[u8]) -> BlobRecord {
        let now = Utc::now();
        BlobRecord {
            cid: Cid::of(payload),
            size: payload.len() as u64,
            content_type: ContentType::Media,
            guild: Some(GuildId::new("g1")),
            shard: 7,
            origin: BlobOrigin::Replica {
                from: "12D3KooWPeer".to_string(),
            },
            pinned: false,
            stored_at: now,
            last_accessed: now,
            replicas: Vec::new(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let rec = record(b"one");
        db.insert_blob(&rec).unwrap();

        let found = db.get_blob(&rec.cid).unwrap();
        assert_eq!(found.cid, rec.cid);
        assert_eq!(found.guild, rec.guild);
        assert_eq!(found.origin, rec.origin);
        assert_eq!(found.content_type, ContentType::Media);

        assert!(db.find_blob(&Cid::of(b"missing")).unwrap().is_none());
    }

    #[test]
    fn test_replicas_cascade_on_delete() {
        let db = Database::open_in_memory().unwrap();
        let rec = record(b"two");
        db.insert_blob(&rec).unwrap();

        db.upsert_replica(&rec.cid, "peer-a", Utc::now()).unwrap();
        db.upsert_replica(&rec.cid, "peer-a", Utc::now()).unwrap();
        db.upsert_replica(&rec.cid, "peer-b", Utc::now()).unwrap();
        assert_eq!(db.replicas_for(&rec.cid).unwrap().len(), 2);

        assert!(db.delete_replica(&rec.cid, "peer-b").unwrap());
        assert_eq!(db.get_blob(&rec.cid).unwrap().replicas.len(), 1);

        assert!(db.delete_blob(&rec.cid).unwrap());
        assert!(db.replicas_for(&rec.cid).unwrap().is_empty());
    }

    #[test]
    fn test_set_origin() {
        let db = Database::open_in_memory().unwrap();
        let rec = record(b"promote");
        db.insert_blob(&rec).unwrap();

        assert!(db.set_origin(&rec.cid, &BlobOrigin::Local).unwrap());
        assert_eq!(db.get_blob(&rec.cid).unwrap().origin, BlobOrigin::Local);
        assert!(!db.set_origin(&Cid::of(b"missing"), &BlobOrigin::Local).unwrap());
    }

    #[test]
    fn test_stats_split_pinned_bytes() {
        let db = Database::open_in_memory().unwrap();
        let a = record(b"aaaa");
        let b = record(b"bbbbbbbb");
        db.insert_blob(&a).unwrap();
        db.insert_blob(&b).unwrap();
        db.set_pinned(&b.cid, true).unwrap();

        let stats = db.blob_stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_bytes, 12);
        assert_eq!(stats.pinned_bytes, 8);
    }
}
