/// Schema for the cache database.
///
/// Timestamps are stored as milliseconds since the Unix epoch.
pub const SCHEMA: &str = r#"
-- Cached dashboard responses, one row per (domain, endpoint)
CREATE TABLE IF NOT EXISTS dashboards (
    domain TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    data BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (domain, endpoint)
);

CREATE INDEX IF NOT EXISTS idx_dashboards_domain ON dashboards(domain);
CREATE INDEX IF NOT EXISTS idx_dashboards_timestamp ON dashboards(timestamp);

-- Bookkeeping values (last eviction, last cleanup)
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Mutations captured while offline, replayed in id order
CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    operation TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
