// =============================================================================
// CONVERSATION STORE
// =============================================================================
//
// One rolling history per (member, channel, guild). When a guild runs in
// collaborative mode the channel id stands in for the member id so everybody
// in the channel shares a history.
//
// The store is a DashMap so independent chats never contend, but callers
// must not hold an entry across an await: take a snapshot, do the network
// work, then write it back.

use super::models::{ChatMessage, Role};
use super::tokens::estimate_tokens;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationKey {
    pub member_id: u64,
    pub channel_id: u64,
    pub guild_id: u64,
}

impl ConversationKey {
    pub fn new(member_id: u64, channel_id: u64, guild_id: u64, collab: bool) -> Self {
        Self {
            member_id: if collab { channel_id } else { member_id },
            channel_id,
            guild_id,
        }
    }
}

/// Retention limits resolved for one member.
#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    /// Max messages kept. 0 keeps nothing between turns.
    pub max_messages: usize,
    /// Seconds of inactivity before the history is dropped. 0 never expires.
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    /// Unix timestamp (seconds) of the last change.
    pub last_updated: i64,
}

impl Conversation {
    pub fn function_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_function_result())
            .count()
    }

    pub fn token_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    pub fn is_expired(&self, max_age_secs: u64) -> bool {
        if max_age_secs == 0 {
            return false;
        }
        Utc::now().timestamp() - self.last_updated > max_age_secs as i64
    }

    /// Applies the expiry and count bounds.
    pub fn cleanup(&mut self, limits: RetentionLimits) {
        if self.is_expired(limits.max_age_secs) || limits.max_messages == 0 {
            self.messages.clear();
            return;
        }

        if self.messages.len() > limits.max_messages {
            let excess = self.messages.len() - limits.max_messages;
            self.messages.drain(..excess);
        }

        // A function result without the call that produced it is rejected by the API
        while self
            .messages
            .first()
            .is_some_and(|m| m.is_function_result())
        {
            self.messages.remove(0);
        }
    }

    pub fn refresh(&mut self) {
        self.last_updated = Utc::now().timestamp();
    }

    pub fn reset(&mut self) {
        self.refresh();
        self.messages.clear();
    }

    /// Replaces the history with `messages`, minus any system entries.
    pub fn overwrite(&mut self, messages: &[ChatMessage]) {
        self.reset();
        self.messages.extend(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );
    }

    pub fn update_messages(&mut self, content: &str, role: Role, name: Option<String>) {
        self.messages
            .push(ChatMessage::new(role, content).with_name(name));
        self.refresh();
    }

    /// Builds the payload for the API: system prompt, initial prompt, history,
    /// then the new user message. The user message is also recorded.
    pub fn prepare_chat(
        &mut self,
        user_message: &str,
        initial_prompt: &str,
        system_prompt: &str,
        name: Option<String>,
    ) -> PreparedChat {
        let mut messages = Vec::with_capacity(self.messages.len() + 3);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        if !initial_prompt.is_empty() {
            messages.push(ChatMessage::user(initial_prompt));
        }
        let pinned = messages.len();

        messages.extend(self.messages.iter().cloned());
        let user = ChatMessage::user(user_message).with_name(name);
        messages.push(user.clone());
        self.messages.push(user);
        self.refresh();

        PreparedChat { messages, pinned }
    }
}

/// The payload sent to the model. The first `pinned` entries are the
/// system/initial prompts and are never evicted.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub messages: Vec<ChatMessage>,
    pub pinned: usize,
}

impl PreparedChat {
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages[self.pinned.min(self.messages.len())..]
    }
}

/// One conversation as written to the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedConversation {
    pub key: ConversationKey,
    pub conversation: Conversation,
}

/// Process-wide conversation cache.
#[derive(Default)]
pub struct ConversationStore {
    conversations: DashMap<ConversationKey, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the conversation (empty if we've never seen this key).
    pub fn snapshot(&self, key: &ConversationKey) -> Conversation {
        self.conversations
            .get(key)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn save(&self, key: ConversationKey, conversation: Conversation) {
        self.conversations.insert(key, conversation);
    }

    pub fn reset(&self, key: &ConversationKey) {
        if let Some(mut convo) = self.conversations.get_mut(key) {
            convo.reset();
        }
    }

    /// Drops every conversation in a guild. Returns how many were removed.
    pub fn clear_guild(&self, guild_id: u64) -> usize {
        let before = self.conversations.len();
        self.conversations.retain(|key, _| key.guild_id != guild_id);
        before - self.conversations.len()
    }

    /// Drops a guild's conversations that are empty or idle for longer than `max_age_secs`.
    pub fn purge_guild_stale(&self, guild_id: u64, max_age_secs: u64) -> usize {
        let before = self.conversations.len();
        self.conversations.retain(|key, convo| {
            key.guild_id != guild_id
                || (!convo.messages.is_empty() && !convo.is_expired(max_age_secs))
        });
        before - self.conversations.len()
    }

    /// Every guild with at least one cached conversation.
    pub fn guild_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.conversations.iter().map(|e| e.key().guild_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Non-empty conversations belonging to the guilds `keep` accepts.
    pub fn export(&self, keep: impl Fn(u64) -> bool) -> Vec<SavedConversation> {
        self.conversations
            .iter()
            .filter(|e| keep(e.key().guild_id) && !e.value().messages.is_empty())
            .map(|e| SavedConversation {
                key: *e.key(),
                conversation: e.value().clone(),
            })
            .collect()
    }

    /// Loads saved conversations, leaving newer in-memory ones alone.
    pub fn restore(&self, saved: Vec<SavedConversation>) -> usize {
        let mut restored = 0;
        for entry in saved {
            if self.conversations.contains_key(&entry.key) {
                continue;
            }
            self.conversations.insert(entry.key, entry.conversation);
            restored += 1;
        }
        restored
    }
}
