/// Schema for the offline store. Applied on every open; every statement is idempotent.
pub const SCHEMA: &str = r#"
-- Cache generations; at most one row is 'active'
CREATE TABLE IF NOT EXISTS cache_generations (
    generation TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Request/response pairs, scoped to a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (generation, cache_key)
);

-- Write queue: one row per submitted mutation, ordered by seq
CREATE TABLE IF NOT EXISTS queue_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    operation TEXT NOT NULL,
    target TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    -- Replayer holding an IN_FLIGHT item and when it claimed it (unix ms)
    claimed_by TEXT,
    claimed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status, seq);

-- Known document identifiers, local uniqueness guard for optimistic ids
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY,
    family TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_partition ON documents(family, partition_key);
"#;

/// Columns added after the first release, applied to older files that
/// predate them. `(table, column, definition)`.
pub const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
  ("queue_items", "claimed_by", "TEXT"),
  ("queue_items", "claimed_at", "INTEGER"),
];
