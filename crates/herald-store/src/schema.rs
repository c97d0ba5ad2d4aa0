/// SQL DDL for the herald state database.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS topics (
    source TEXT PRIMARY KEY,
    thread_id INTEGER NOT NULL,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS forwarded (
    event_key TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    thread_id INTEGER,
    message_id INTEGER NOT NULL,
    event_time TEXT NOT NULL,
    forwarded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cursors (
    source TEXT PRIMARY KEY,
    last_event_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topics_thread ON topics(thread_id);
CREATE INDEX IF NOT EXISTS idx_forwarded_source ON forwarded(source, event_time);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
