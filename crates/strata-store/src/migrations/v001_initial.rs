//! v001 -- Initial schema creation.
//!
//! Creates `blobs`, `replicas`, `policy` and `node_meta`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Blob metadata (payload bytes live on disk, named by cid)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blobs (
    cid           TEXT PRIMARY KEY NOT NULL,  -- hex BLAKE3
    size          INTEGER NOT NULL,
    content_type  TEXT NOT NULL,              -- message | post | media | listing
    guild         TEXT,
    shard         INTEGER NOT NULL,
    origin        TEXT NOT NULL,              -- local | replica
    origin_peer   TEXT,                       -- pushing peer for replica origin
    pinned        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    stored_at     TEXT NOT NULL,              -- RFC-3339
    last_accessed TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_blobs_last_accessed ON blobs(last_accessed);

-- ----------------------------------------------------------------
-- Replica sets: peers known to hold a copy
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS replicas (
    cid           TEXT NOT NULL,
    peer_id       TEXT NOT NULL,
    last_verified TEXT NOT NULL,

    PRIMARY KEY (cid, peer_id),
    FOREIGN KEY (cid) REFERENCES blobs(cid) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Content policy (single JSON document)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS policy (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    document   TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Node facts that must survive restarts (shard count, ...)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS node_meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
