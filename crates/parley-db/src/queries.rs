use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use parley_types::events::StoreChange;
use parley_types::models::{
    Attachment, Message, MessageDraft, MessageKind, ReactionAggregate, TypingPresence, Versioned,
};

use crate::Database;
use crate::models::{MessageRow, PresenceRow};

const MESSAGE_COLUMNS: &str = "id, group_id, author_id, author_name, author_avatar, kind, body, \
     attachment, created_at, edited_at, reply_to_id, reactions, deleted, deleted_at, version";

impl Database {
    // -- Messages --

    /// Append a message. The store assigns the id and a `created_at` that is
    /// strictly greater than every earlier message in the same group.
    pub fn insert_message(&self, draft: &MessageDraft) -> Result<Message> {
        let id = Uuid::new_v4();
        let now_ms = self.now().timestamp_millis();
        let attachment = draft
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let group_id = draft.group_id.to_string();

        let row = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let last: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE group_id = ?1",
                [&group_id],
                |row| row.get(0),
            )?;
            let created_at = last.map_or(now_ms, |last| now_ms.max(last + 1));

            let row = MessageRow {
                id: id.to_string(),
                group_id: group_id.clone(),
                author_id: draft.author.user_id.to_string(),
                author_name: draft.author.display_name.clone(),
                author_avatar: draft.author.avatar.clone(),
                kind: draft.kind.as_str().to_string(),
                body: draft.body.clone(),
                attachment: attachment.clone(),
                created_at,
                edited_at: None,
                reply_to_id: draft.reply_to_id.map(|id| id.to_string()),
                reactions: "{}".to_string(),
                deleted: false,
                deleted_at: None,
                version: 0,
            };

            tx.execute(
                "INSERT INTO messages (id, group_id, author_id, author_name, author_avatar, kind, body, attachment, created_at, reply_to_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    row.id,
                    row.group_id,
                    row.author_id,
                    row.author_name,
                    row.author_avatar,
                    row.kind,
                    row.body,
                    row.attachment,
                    row.created_at,
                    row.reply_to_id,
                ],
            )?;
            tx.commit()?;
            Ok(row)
        })?;

        self.publish(StoreChange::Messages { group_id: draft.group_id });
        message_from_row(row)
    }

    pub fn get_message(&self, group_id: Uuid, id: Uuid) -> Result<Option<Versioned<Message>>> {
        let row = self.with_conn(|conn| query_message(conn, &group_id.to_string(), &id.to_string()))?;

        row.map(|row| {
            let version = row.version;
            message_from_row(row).map(|value| Versioned { value, version })
        })
        .transpose()
    }

    /// Conditional write: replaces the mutable fields of `message` only if the
    /// stored document is still at `expected_version`. Returns `false` when
    /// another writer got there first (or the document is gone).
    pub fn replace_message(&self, message: &Message, expected_version: i64) -> Result<bool> {
        let attachment = message
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let reactions = encode_reactions(&message.reactions)?;

        let changed = self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET body = ?1, attachment = ?2, edited_at = ?3, reactions = ?4,
                     deleted = ?5, deleted_at = ?6, version = version + 1
                 WHERE id = ?7 AND group_id = ?8 AND version = ?9",
                rusqlite::params![
                    message.body,
                    attachment,
                    message.edited_at.map(|t| t.timestamp_millis()),
                    reactions,
                    message.deleted,
                    message.deleted_at.map(|t| t.timestamp_millis()),
                    message.id.to_string(),
                    message.group_id.to_string(),
                    expected_version,
                ],
            )?;
            Ok(changed)
        })?;

        if changed == 1 {
            self.publish(StoreChange::Messages { group_id: message.group_id });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Most recent `limit` messages of a group, newest first.
    pub fn recent_messages(&self, group_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| query_recent_messages(conn, &group_id.to_string(), limit))?;
        rows.into_iter().map(message_from_row).collect()
    }

    // -- Presence --

    /// Create or refresh a typing entry, stamping it with server time.
    pub fn upsert_presence(&self, group_id: Uuid, user_id: Uuid, display_name: &str) -> Result<TypingPresence> {
        let now = self.now();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO presence (group_id, user_id, display_name, last_signal_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (group_id, user_id)
                 DO UPDATE SET display_name = excluded.display_name, last_signal_at = excluded.last_signal_at",
                rusqlite::params![group_id.to_string(), user_id.to_string(), display_name, now.timestamp_millis()],
            )?;
            Ok(())
        })?;

        self.publish(StoreChange::Presence { group_id });
        Ok(TypingPresence {
            user_id,
            display_name: display_name.to_string(),
            last_signal_at: now,
        })
    }

    /// Returns whether an entry was removed.
    pub fn delete_presence(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let removed = self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM presence WHERE group_id = ?1 AND user_id = ?2",
                [group_id.to_string(), user_id.to_string()],
            )?;
            Ok(n > 0)
        })?;

        if removed {
            self.publish(StoreChange::Presence { group_id });
        }
        Ok(removed)
    }

    /// All presence entries of a group, stale ones included.
    pub fn list_presence(&self, group_id: Uuid) -> Result<Vec<TypingPresence>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, display_name, last_signal_at FROM presence WHERE group_id = ?1",
            )?;
            let rows = stmt
                .query_map([group_id.to_string()], |row| {
                    Ok(PresenceRow {
                        user_id: row.get(0)?,
                        display_name: row.get(1)?,
                        last_signal_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|row| {
                Ok(TypingPresence {
                    user_id: parse_uuid(&row.user_id, "presence user_id")?,
                    display_name: row.display_name,
                    last_signal_at: from_millis(row.last_signal_at)?,
                })
            })
            .collect()
    }

    /// Delete presence rows last signalled before `cutoff`. Returns the number
    /// of rows removed.
    pub fn prune_presence(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();

        let (groups, removed) = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let groups: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT DISTINCT group_id FROM presence WHERE last_signal_at < ?1")?;
                stmt.query_map([cutoff_ms], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let removed = tx.execute("DELETE FROM presence WHERE last_signal_at < ?1", [cutoff_ms])?;
            tx.commit()?;
            Ok((groups, removed))
        })?;

        for group in &groups {
            if let Ok(group_id) = group.parse::<Uuid>() {
                self.publish(StoreChange::Presence { group_id });
            }
        }
        Ok(removed)
    }
}

fn query_message(conn: &Connection, group_id: &str, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE group_id = ?1 AND id = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([group_id, id], read_message_row).optional()?;
    Ok(row)
}

fn query_recent_messages(conn: &Connection, group_id: &str, limit: usize) -> Result<Vec<MessageRow>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE group_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![group_id, limit as i64], read_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        author_avatar: row.get(4)?,
        kind: row.get(5)?,
        body: row.get(6)?,
        attachment: row.get(7)?,
        created_at: row.get(8)?,
        edited_at: row.get(9)?,
        reply_to_id: row.get(10)?,
        reactions: row.get(11)?,
        deleted: row.get(12)?,
        deleted_at: row.get(13)?,
        version: row.get(14)?,
    })
}

fn message_from_row(row: MessageRow) -> Result<Message> {
    let kind = MessageKind::parse(&row.kind)
        .ok_or_else(|| anyhow!("Corrupt kind '{}' on message '{}'", row.kind, row.id))?;
    let attachment = row
        .attachment
        .as_deref()
        .map(serde_json::from_str::<Attachment>)
        .transpose()
        .with_context(|| format!("Corrupt attachment on message '{}'", row.id))?;
    let reactions = decode_reactions(&row.reactions)
        .with_context(|| format!("Corrupt reactions on message '{}'", row.id))?;

    Ok(Message {
        id: parse_uuid(&row.id, "message id")?,
        group_id: parse_uuid(&row.group_id, "group_id")?,
        author_id: parse_uuid(&row.author_id, "author_id")?,
        author_name: row.author_name,
        author_avatar: row.author_avatar,
        kind,
        body: row.body,
        attachment,
        created_at: from_millis(row.created_at)?,
        edited_at: row.edited_at.map(from_millis).transpose()?,
        reply_to_id: row
            .reply_to_id
            .as_deref()
            .map(|id| parse_uuid(id, "reply_to_id"))
            .transpose()?,
        reactions,
        deleted: row.deleted,
        deleted_at: row.deleted_at.map(from_millis).transpose()?,
    })
}

/// Reactions are persisted as `{emoji: [voter ids]}`; counts are derived on
/// read so they can never drift from the voter set.
fn encode_reactions(reactions: &BTreeMap<String, ReactionAggregate>) -> Result<String> {
    let voters: BTreeMap<&str, &BTreeSet<Uuid>> = reactions
        .iter()
        .filter(|(_, agg)| !agg.voter_ids.is_empty())
        .map(|(emoji, agg)| (emoji.as_str(), &agg.voter_ids))
        .collect();
    Ok(serde_json::to_string(&voters)?)
}

fn decode_reactions(raw: &str) -> Result<BTreeMap<String, ReactionAggregate>> {
    let voters: BTreeMap<String, BTreeSet<Uuid>> = serde_json::from_str(raw)?;
    Ok(voters
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(emoji, ids)| (emoji.clone(), ReactionAggregate::from_voters(emoji, ids)))
        .collect())
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .map_err(|e| anyhow!("Corrupt {} '{}': {}", what, raw, e))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Timestamp out of range: {}", ms))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_types::clock::{Clock, ManualClock};
    use parley_types::models::Identity;
    use std::sync::Arc;

    fn draft(group_id: Uuid, body: &str) -> MessageDraft {
        MessageDraft {
            group_id,
            author: Identity {
                user_id: Uuid::new_v4(),
                display_name: "ana".into(),
                avatar: None,
            },
            kind: MessageKind::Text,
            body: body.into(),
            attachment: None,
            reply_to_id: None,
        }
    }

    fn frozen_db() -> (Database, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let db = Database::open_in_memory().unwrap().with_clock(clock.clone());
        (db, clock)
    }

    #[test]
    fn created_at_strictly_increases_under_frozen_clock() {
        let (db, _clock) = frozen_db();
        let group = Uuid::new_v4();

        let a = db.insert_message(&draft(group, "one")).unwrap();
        let b = db.insert_message(&draft(group, "two")).unwrap();
        let c = db.insert_message(&draft(group, "three")).unwrap();

        assert!(a.created_at < b.created_at);
        assert!(b.created_at < c.created_at);
    }

    #[test]
    fn recent_messages_are_newest_first_and_capped() {
        let (db, clock) = frozen_db();
        let group = Uuid::new_v4();
        for i in 0..5 {
            db.insert_message(&draft(group, &format!("m{i}"))).unwrap();
            clock.advance(Duration::seconds(1));
        }
        db.insert_message(&draft(Uuid::new_v4(), "elsewhere")).unwrap();

        let recent = db.recent_messages(group, 3).unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m3", "m2"]);
    }

    #[test]
    fn replace_rejects_stale_version() {
        let (db, _clock) = frozen_db();
        let group = Uuid::new_v4();
        let msg = db.insert_message(&draft(group, "hello")).unwrap();

        let read = db.get_message(group, msg.id).unwrap().unwrap();
        let mut next = read.value.clone();
        next.body = "edited".into();
        assert!(db.replace_message(&next, read.version).unwrap());

        // Same expected version again: someone already moved it on.
        next.body = "lost".into();
        assert!(!db.replace_message(&next, read.version).unwrap());

        let stored = db.get_message(group, msg.id).unwrap().unwrap();
        assert_eq!(stored.value.body, "edited");
        assert_eq!(stored.version, read.version + 1);
    }

    #[test]
    fn reactions_persist_voters_and_drop_empty_entries() {
        let (db, _clock) = frozen_db();
        let group = Uuid::new_v4();
        let msg = db.insert_message(&draft(group, "react to me")).unwrap();
        let voter = Uuid::new_v4();

        let mut next = msg.clone();
        next.reactions.insert(
            "🔥".into(),
            ReactionAggregate::from_voters("🔥", BTreeSet::from([voter])),
        );
        next.reactions.insert("👍".into(), ReactionAggregate::empty("👍"));
        assert!(db.replace_message(&next, 0).unwrap());

        let stored = db.get_message(group, msg.id).unwrap().unwrap().value;
        assert_eq!(stored.reactions.len(), 1);
        let fire = &stored.reactions["🔥"];
        assert_eq!(fire.count, 1);
        assert!(fire.contains(&voter));
    }

    #[test]
    fn get_message_is_scoped_to_group() {
        let (db, _clock) = frozen_db();
        let msg = db.insert_message(&draft(Uuid::new_v4(), "hi")).unwrap();
        assert!(db.get_message(Uuid::new_v4(), msg.id).unwrap().is_none());
    }

    #[test]
    fn presence_upsert_refreshes_and_prune_removes_old_rows() {
        let (db, clock) = frozen_db();
        let group = Uuid::new_v4();
        let (ana, ben) = (Uuid::new_v4(), Uuid::new_v4());

        db.upsert_presence(group, ana, "ana").unwrap();
        clock.advance(Duration::seconds(10));
        db.upsert_presence(group, ben, "ben").unwrap();
        db.upsert_presence(group, ben, "ben b.").unwrap();

        let entries = db.list_presence(group).unwrap();
        assert_eq!(entries.len(), 2);

        let removed = db.prune_presence(clock.now() - Duration::seconds(5)).unwrap();
        assert_eq!(removed, 1);

        let entries = db.list_presence(group).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, ben);
        assert_eq!(entries[0].display_name, "ben b.");

        assert!(db.delete_presence(group, ben).unwrap());
        assert!(!db.delete_presence(group, ben).unwrap());
    }

    #[test]
    fn returned_presence_matches_stored_row() {
        let (db, _clock) = frozen_db();
        let group = Uuid::new_v4();

        let written = db.upsert_presence(group, Uuid::new_v4(), "ana").unwrap();
        assert_eq!(db.list_presence(group).unwrap(), vec![written]);
    }

    #[test]
    fn writes_publish_change_events() {
        let (db, _clock) = frozen_db();
        let mut changes = db.watch();
        let group = Uuid::new_v4();

        db.insert_message(&draft(group, "hello")).unwrap();
        db.upsert_presence(group, Uuid::new_v4(), "ana").unwrap();

        assert_eq!(changes.try_recv().unwrap(), StoreChange::Messages { group_id: group });
        assert_eq!(changes.try_recv().unwrap(), StoreChange::Presence { group_id: group });
    }
}
