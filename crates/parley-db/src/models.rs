/// Database row types. These map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent.
/// Timestamps are unix milliseconds; attachment and reactions are JSON.

pub struct MessageRow {
    pub id: String,
    pub group_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub kind: String,
    pub body: String,
    pub attachment: Option<String>,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub reply_to_id: Option<String>,
    pub reactions: String,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
    pub version: i64,
}

pub struct PresenceRow {
    pub user_id: String,
    pub display_name: String,
    pub last_signal_at: i64,
}
