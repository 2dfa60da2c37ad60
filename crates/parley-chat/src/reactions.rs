use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use parley_types::models::ReactionAggregate;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult, within};
use crate::store::ChatStore;
use crate::txn::read_modify_write;

/// Per-message, per-emoji voter sets.
///
/// Toggles go through the store's optimistic read-modify-write so two users
/// reacting at the same moment can never lose each other's vote.
pub struct ReactionAggregator<S> {
    store: Arc<S>,
    config: Arc<ChatConfig>,
}

impl<S> Clone for ReactionAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ChatStore> ReactionAggregator<S> {
    pub fn new(store: Arc<S>, config: Arc<ChatConfig>) -> Self {
        Self { store, config }
    }

    /// Add `user_id` to the voters of `emoji`, or remove them if already
    /// there. Returns the aggregate after the toggle; an aggregate that
    /// dropped to zero voters is returned empty and removed from the message.
    pub async fn toggle(
        &self,
        group_id: Uuid,
        message_id: Uuid,
        emoji: &str,
        user_id: Uuid,
    ) -> ChatResult<ReactionAggregate> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::validation("emoji is empty"));
        }
        if emoji.len() > self.config.max_emoji_bytes {
            return Err(ChatError::validation("emoji is too long"));
        }
        let emoji = emoji.to_string();

        let toggle = read_modify_write(
            &self.store,
            group_id,
            message_id,
            self.config.write_attempts,
            move |current, _now| {
                // Deleted messages are not reactable; treat them as gone.
                if current.deleted {
                    return Err(ChatError::NotFound);
                }
                let mut next = current.clone();
                let aggregate = toggle_vote(&mut next.reactions, &emoji, user_id);
                Ok((next, aggregate))
            },
        );
        let aggregate = within(self.config.mutation_timeout, toggle).await?;

        debug!(
            "Reaction {} on {} by {}: {} voters",
            aggregate.emoji, message_id, user_id, aggregate.count
        );
        Ok(aggregate)
    }
}

/// Flip one user's vote in a reaction map, keeping `count == |voters|` and
/// removing entries that end up empty.
pub fn toggle_vote(
    reactions: &mut BTreeMap<String, ReactionAggregate>,
    emoji: &str,
    user_id: Uuid,
) -> ReactionAggregate {
    let entry = reactions
        .entry(emoji.to_string())
        .or_insert_with(|| ReactionAggregate::empty(emoji));

    if !entry.voter_ids.remove(&user_id) {
        entry.voter_ids.insert(user_id);
    }
    entry.count = entry.voter_ids.len();

    let aggregate = entry.clone();
    if aggregate.voter_ids.is_empty() {
        reactions.remove(emoji);
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::collections::BTreeSet;

    fn assert_sparse_and_consistent(reactions: &BTreeMap<String, ReactionAggregate>) {
        for (emoji, agg) in reactions {
            assert_eq!(&agg.emoji, emoji);
            assert_eq!(agg.count, agg.voter_ids.len());
            assert!(agg.count > 0, "empty aggregate kept for {emoji}");
        }
    }

    #[test]
    fn toggle_vote_adds_then_removes() {
        let mut reactions = BTreeMap::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(toggle_vote(&mut reactions, "🔥", a).count, 1);
        assert_eq!(toggle_vote(&mut reactions, "🔥", b).count, 2);
        assert_eq!(toggle_vote(&mut reactions, "👍", a).count, 1);
        assert_sparse_and_consistent(&reactions);

        let after = toggle_vote(&mut reactions, "🔥", a);
        assert_eq!(after.voter_ids, BTreeSet::from([b]));

        let gone = toggle_vote(&mut reactions, "👍", a);
        assert_eq!(gone.count, 0);
        assert!(!reactions.contains_key("👍"));
        assert_sparse_and_consistent(&reactions);
    }

    #[tokio::test]
    async fn toggling_twice_restores_original_state() {
        let (chat, db, _clock, _notes) = test_service();
        let group = Uuid::new_v4();
        let ana = identity("ana");
        let msg = chat.messages().append(text_draft(group, &ana, "hi")).await.unwrap();

        let added = chat.reactions().toggle(group, msg.id, "🔥", ana.user_id).await.unwrap();
        assert_eq!(added.count, 1);
        assert!(added.contains(&ana.user_id));

        let removed = chat.reactions().toggle(group, msg.id, "🔥", ana.user_id).await.unwrap();
        assert_eq!(removed.count, 0);

        let stored = db.get_message(group, msg.id).unwrap().unwrap().value;
        assert!(stored.reactions.is_empty());
    }

    #[tokio::test]
    async fn deleted_or_missing_messages_cannot_be_reacted_to() {
        let (chat, _db, _clock, _notes) = test_service();
        let group = Uuid::new_v4();
        let ana = identity("ana");
        let msg = chat.messages().append(text_draft(group, &ana, "bye")).await.unwrap();
        chat.messages().delete(group, msg.id, ana.user_id).await.unwrap();

        let err = chat.reactions().toggle(group, msg.id, "🔥", ana.user_id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound));

        let err = chat
            .reactions()
            .toggle(group, Uuid::new_v4(), "🔥", ana.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound));
    }

    #[tokio::test]
    async fn rejects_blank_or_oversized_emoji() {
        let (chat, _db, _clock, _notes) = test_service();
        let group = Uuid::new_v4();
        let ana = identity("ana");
        let msg = chat.messages().append(text_draft(group, &ana, "hi")).await.unwrap();

        let long = "🔥".repeat(20);
        for emoji in ["", "  ", long.as_str()] {
            let err = chat.reactions().toggle(group, msg.id, emoji, ana.user_id).await.unwrap_err();
            assert!(matches!(err, ChatError::Validation(_)), "{emoji:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_from_two_users_never_lose_a_vote() {
        let (chat, db, _clock, _notes) = test_service();
        let group = Uuid::new_v4();
        let (ana, ben) = (identity("ana"), identity("ben"));

        for _ in 0..20 {
            let msg = chat.messages().append(text_draft(group, &ana, "race")).await.unwrap();

            let (a, b) = tokio::join!(
                chat.reactions().toggle(group, msg.id, "🔥", ana.user_id),
                chat.reactions().toggle(group, msg.id, "🔥", ben.user_id),
            );
            a.unwrap();
            b.unwrap();

            let stored = db.get_message(group, msg.id).unwrap().unwrap().value;
            let fire = &stored.reactions["🔥"];
            assert_eq!(fire.count, 2);
            assert_eq!(fire.voter_ids, BTreeSet::from([ana.user_id, ben.user_id]));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contention_within_attempt_budget_converges() {
        let (chat, db, _clock, _notes) = test_service();
        let group = Uuid::new_v4();
        let author = identity("author");
        let msg = chat.messages().append(text_draft(group, &author, "pile on")).await.unwrap();
        let message_id = msg.id;

        // Each lost race means another voter committed, so N voters need at
        // most N attempts; the default budget is 5.
        let voters: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let tasks: Vec<_> = voters
            .iter()
            .map(|&voter| {
                let reactions = chat.reactions().clone();
                tokio::spawn(async move { reactions.toggle(group, message_id, "🎉", voter).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = db.get_message(group, msg.id).unwrap().unwrap().value;
        let party = &stored.reactions["🎉"];
        assert_eq!(party.count, voters.len());
        assert_eq!(party.voter_ids, voters.into_iter().collect::<BTreeSet<_>>());
        assert_sparse_and_consistent(&stored.reactions);
    }

    #[tokio::test]
    async fn interleaved_writer_forces_retry_without_losing_its_vote() {
        let (store, _clock) = faulty_store();
        let chat = service_over(store.clone());
        let group = Uuid::new_v4();
        let (ana, ben) = (identity("ana"), identity("ben"));
        let msg = chat.messages().append(text_draft(group, &ana, "hi")).await.unwrap();

        // Ben's toggle commits between Ana's read and Ana's conditional write.
        let (ben_id, message_id) = (ben.user_id, msg.id);
        store.before_next_replace(move |db| {
            let current = db.get_message(group, message_id).unwrap().unwrap();
            let mut next = current.value.clone();
            toggle_vote(&mut next.reactions, "🔥", ben_id);
            assert!(db.replace_message(&next, current.version).unwrap());
        });

        let result = chat.reactions().toggle(group, msg.id, "🔥", ana.user_id).await.unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.voter_ids, BTreeSet::from([ana.user_id, ben.user_id]));
        assert_eq!(store.replace_calls(), 2);
    }

    #[tokio::test]
    async fn persistent_conflict_exhausts_budget() {
        let (store, _clock) = faulty_store();
        let chat = service_over(store.clone());
        let group = Uuid::new_v4();
        let ana = identity("ana");
        let msg = chat.messages().append(text_draft(group, &ana, "hi")).await.unwrap();

        store.conflict_next(u32::MAX);
        let err = chat.reactions().toggle(group, msg.id, "🔥", ana.user_id).await.unwrap_err();

        assert!(matches!(err, ChatError::TransientConflict { attempts: 5 }));
        assert!(err.is_retryable());
        assert_eq!(store.replace_calls(), 5);

        store.conflict_next(0);
        let stored = store.inner().get_message(group, msg.id).unwrap().unwrap().value;
        assert!(stored.reactions.is_empty());
    }
}
