// =============================================================================
// ASSISTANT SERVICE
// =============================================================================
//
// The chat pipeline and everything the Discord layer needs around it. Like
// the other services, this one knows nothing about Discord: the caller hands
// us ids, a `Requester` and a `PromptContext` and gets text back.
//
// Conversations are read as a snapshot, worked on across the network awaits
// and written back at the end. Two messages from the same member racing each
// other means the later write wins, which is fine for a chat history.

use super::archive::ConversationArchive;
use super::budget::{degrade_conversation, max_conversation_tokens, payload_limit};
use super::conversation::{ConversationKey, ConversationStore, RetentionLimits};
use super::embedding_transfer::TextRow;
use super::embeddings::{get_related_embeddings, Embedding, EmbeddingStore, RelatedEmbedding};
use super::errors::AssistantError;
use super::filter::{apply_blacklist, BLOCKED_REPLY};
use super::functions::{FunctionContext, FunctionRegistry, FunctionSet};
use super::intake::clean_name;
use super::memory::{MemoryTools, MEMORY_OWNER};
use super::models::{ChatMessage, FunctionCall, GuildSettings, Requester, Role, TokenUsage};
use super::prompt::{
    build_params, format_template, inject_embeddings, system_template, AssembledPrompt,
    PromptContext,
};
use super::provider::{ChatProvider, ChatRequest, EndpointConfig};
use super::settings_store::SettingsStore;
use super::tokens::{cut_text_by_tokens, estimate_tokens, function_tokens, payload_tokens};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Longest message we'll accept from a user, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1_048_576;

/// Input limit of the embedding endpoint, in tokens.
pub const MAX_EMBED_TOKENS: usize = 8191;

/// Functions whose success earns the user's message a 🧠 reaction.
const MEMORY_WRITERS: &[&str] = &["create_memory", "edit_memory"];

const REACT_SUMMARY_MESSAGE: &str = "Your job is to summarize text to use as embeddings. \
Respond only with the summary of the text.";
const REACT_NAME_MESSAGE: &str = "Your job is to read a snippet of text and come up with a short \
descriptive name for it. Only respond with the name of the summary.";

/// One chat turn, already through intake.
#[derive(Debug, Clone)]
pub struct ChatInput {
    pub guild_id: u64,
    pub channel_id: u64,
    pub requester: Requester,
    pub message: String,
    pub context: PromptContext,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub reply: String,
    /// A memory function ran successfully.
    pub memory_touched: bool,
    pub function_calls: usize,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct ConversationStats {
    pub messages: usize,
    pub function_results: usize,
    pub tokens: usize,
    pub max_tokens: usize,
    pub max_retention: usize,
    pub max_time: u64,
    pub model: String,
}

pub struct AssistantService {
    provider: Arc<dyn ChatProvider>,
    settings: Arc<dyn SettingsStore>,
    embeddings: Arc<dyn EmbeddingStore>,
    conversations: ConversationStore,
    functions: FunctionRegistry,
    archive: Option<Arc<dyn ConversationArchive>>,
}

fn endpoint_for(settings: &GuildSettings) -> EndpointConfig {
    EndpointConfig {
        api_key: settings.api_key.clone(),
        base_url: settings.endpoint_override.clone(),
    }
}

fn retention_for(settings: &GuildSettings, requester: &Requester) -> RetentionLimits {
    RetentionLimits {
        max_messages: settings.get_user_max_retention(requester),
        max_age_secs: settings.get_user_max_time(requester),
    }
}

impl AssistantService {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        settings: Arc<dyn SettingsStore>,
        embeddings: Arc<dyn EmbeddingStore>,
    ) -> Self {
        let functions = FunctionRegistry::new();
        let memory = MemoryTools::new(Arc::clone(&provider), Arc::clone(&embeddings));
        for function in memory.functions() {
            if let Err(e) = functions.register(MEMORY_OWNER, function) {
                tracing::error!("Failed to register memory function: {}", e);
            }
        }

        Self {
            provider,
            settings,
            embeddings,
            conversations: ConversationStore::new(),
            functions,
            archive: None,
        }
    }

    /// Keeps conversations of guilds with persistence enabled in `archive`.
    pub fn with_archive(mut self, archive: Arc<dyn ConversationArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Registry other modules can add their own functions to.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn has_global_endpoint(&self) -> bool {
        self.provider.has_global_endpoint()
    }

    // ========================================================================
    // SETTINGS
    // ========================================================================

    pub async fn settings(&self, guild_id: u64) -> Result<GuildSettings, AssistantError> {
        Ok(self.settings.get_settings(guild_id).await?)
    }

    /// Mutates and saves a guild's settings as one step of the store.
    pub async fn update_settings<R, F>(&self, guild_id: u64, f: F) -> Result<R, AssistantError>
    where
        F: FnOnce(&mut GuildSettings) -> R + Send,
        R: Send,
    {
        let mut result = None;
        self.settings
            .update_settings(
                guild_id,
                Box::new(|settings: &mut GuildSettings| result = Some(f(settings))),
            )
            .await?;
        result.ok_or_else(|| AssistantError::Storage("settings edit never ran".to_string()))
    }

    // ========================================================================
    // CHAT
    // ========================================================================

    fn should_embed(
        settings: &GuildSettings,
        embedding_count: u64,
        message: &str,
        history_empty: bool,
    ) -> bool {
        if embedding_count == 0 || settings.top_n == 0 {
            return false;
        }
        if message.split_whitespace().count() < 2 {
            return false;
        }
        if estimate_tokens(message) >= MAX_EMBED_TOKENS {
            return false;
        }
        !settings.question_mode || message.trim_end().ends_with('?') || history_empty
    }

    pub async fn chat(&self, input: ChatInput) -> Result<ChatOutcome, AssistantError> {
        let settings = self.settings.get_settings(input.guild_id).await?;
        if !settings.can_call_llm(self.provider.has_global_endpoint()) {
            return Err(AssistantError::NoApiKey);
        }

        let requester = &input.requester;
        let key = ConversationKey::new(
            requester.user_id,
            input.channel_id,
            input.guild_id,
            settings.collab_convos,
        );
        let mut conversation = self.conversations.snapshot(&key);
        conversation.cleanup(retention_for(&settings, requester));

        let message: String = input.message.chars().take(MAX_MESSAGE_CHARS).collect();
        let model = settings.get_user_model(requester);
        let endpoint = endpoint_for(&settings);
        let embedding_count = self.embeddings.count(input.guild_id).await?;

        let related = if Self::should_embed(
            &settings,
            embedding_count,
            &message,
            conversation.messages.is_empty(),
        ) {
            let query = self.provider.embed(&message, &endpoint).await?;
            let entries = self.embeddings.list(input.guild_id).await?;
            get_related_embeddings(
                &entries,
                &query.vector,
                settings.top_n,
                settings.min_relatedness,
            )
        } else {
            Vec::new()
        };

        let mut functions = self.functions.prepare(
            &settings,
            settings.is_tutor(requester),
            embedding_count > 0,
        );

        let params = build_params(
            &input.context,
            &settings,
            requester,
            &conversation,
            &message,
            Utc::now(),
        );
        let mut prompt = AssembledPrompt {
            system_prompt: format_template(system_template(&settings, input.channel_id), &params),
            initial_prompt: format_template(&settings.prompt, &params),
            message,
        };
        let max_tokens = max_conversation_tokens(&settings, requester);
        let current_tokens = prompt.tokens()
            + payload_tokens(&conversation.messages)
            + function_tokens(&functions.schemas);
        let injected = inject_embeddings(
            &mut prompt,
            &related,
            settings.embed_method,
            current_tokens,
            max_tokens,
        );

        let author_name = clean_name(&input.context.username);
        let mut chat = conversation.prepare_chat(
            &prompt.message,
            prompt.initial_prompt.trim(),
            prompt.system_prompt.trim(),
            author_name,
        );

        let limit = payload_limit(&settings, requester);
        let function_ctx = FunctionContext {
            guild_id: input.guild_id,
            channel_id: input.channel_id,
            user_id: requester.user_id,
            settings: settings.clone(),
            endpoint: endpoint.clone(),
        };
        let max_calls = settings.max_function_calls;
        let mut outcome = ChatOutcome::default();
        let mut reply = None;

        tracing::debug!(
            guild_id = input.guild_id,
            model = %model,
            injected,
            functions = functions.schemas.len(),
            limit,
            "Starting chat"
        );

        // One round per allowed call plus one for the final answer
        for _ in 0..=max_calls {
            let mut offered = if outcome.function_calls >= max_calls {
                Vec::new()
            } else {
                functions.schemas.clone()
            };

            let report = degrade_conversation(&mut chat, &mut offered, limit)?;
            if report.degraded() {
                conversation.overwrite(chat.history());
            }

            let request = ChatRequest {
                model: model.clone(),
                messages: chat.messages.clone(),
                functions: offered,
                temperature: settings.temperature,
                max_tokens: (settings.max_response_tokens > 0)
                    .then(|| u32::try_from(settings.max_response_tokens).unwrap_or(u32::MAX)),
            };
            let response = self.provider.chat_complete(&request, &endpoint).await?;
            outcome.usage.add(response.usage);

            if let Some(text) = response.content.filter(|t| !t.trim().is_empty()) {
                reply = Some(text);
                break;
            }
            if response.function_calls.is_empty() {
                tracing::warn!(model = %model, "No reply and no function calls");
                continue;
            }
            if outcome.function_calls >= max_calls {
                tracing::warn!(max_calls, "Model asked for functions past the call limit");
                break;
            }

            if response.function_calls.len() > 1 {
                tracing::debug!(count = response.function_calls.len(), "Calling functions at once");
            }
            let request_msg = ChatMessage::function_request(response.function_calls.clone());
            chat.messages.push(request_msg.clone());
            conversation.messages.push(request_msg);

            for call in &response.function_calls {
                // Every tool call needs an answer, even the ones we refuse to run
                let (name, result, succeeded) = if outcome.function_calls >= max_calls {
                    (
                        call.name.clone(),
                        "Function call limit reached, answer with what you have".to_string(),
                        false,
                    )
                } else {
                    outcome.function_calls += 1;
                    self.run_function(call, &mut functions, &function_ctx, limit)
                        .await
                };

                if succeeded && MEMORY_WRITERS.contains(&call.name.as_str()) {
                    outcome.memory_touched = true;
                }
                let result_msg = ChatMessage::function_result(call, &name, result);
                chat.messages.push(result_msg.clone());
                conversation.messages.push(result_msg);
            }
            conversation.refresh();
        }

        let Some(text) = reply else {
            self.conversations.save(key, conversation);
            self.record_usage(input.guild_id, &model, outcome.usage, outcome.function_calls)
                .await;
            return Err(AssistantError::FunctionLoopExhausted(outcome.function_calls));
        };

        if outcome.function_calls > 1 {
            tracing::debug!(calls = outcome.function_calls, "Made function calls in a row");
        }

        let filtered = apply_blacklist(text, &settings.regex_blacklist).await;
        conversation.update_messages(
            &filtered.text,
            Role::Assistant,
            clean_name(&input.context.bot_name),
        );
        self.conversations.save(key, conversation);
        self.record_usage(input.guild_id, &model, outcome.usage, outcome.function_calls)
            .await;

        outcome.reply = if filtered.failed && settings.block_failed_regex {
            BLOCKED_REPLY.to_string()
        } else {
            filtered.text
        };
        Ok(outcome)
    }

    /// Runs one function call. Returns (result name, result text, succeeded).
    async fn run_function(
        &self,
        call: &FunctionCall,
        functions: &mut FunctionSet,
        ctx: &FunctionContext,
        max_tokens: usize,
    ) -> (String, String, bool) {
        let Some(function) = functions.get(&call.name) else {
            tracing::error!(function = %call.name, "Model called a function it wasn't given");
            functions.withdraw(&call.name);
            return (
                "invalid_function".to_string(),
                format!("{} is not a valid function name", call.name),
                false,
            );
        };

        let raw = call.arguments.trim();
        let args = if raw.is_empty() || raw == "{}" {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        let args = match args {
            Ok(args) => args,
            Err(_) => {
                return (
                    call.name.clone(),
                    format!(
                        "JSONDecodeError: Failed to parse arguments for function {}",
                        call.name
                    ),
                    false,
                )
            }
        };

        let (result, succeeded) = match function.call(args, ctx).await {
            Ok(result) => (result, true),
            Err(e) => {
                tracing::error!(
                    function = %call.name,
                    arguments = %call.arguments,
                    "Function failed to execute: {}",
                    e
                );
                functions.withdraw(&call.name);
                (format!("Error: {}", e), false)
            }
        };

        tracing::debug!(
            function = %call.name,
            guild_id = ctx.guild_id,
            user_id = ctx.user_id,
            "Called function"
        );
        (call.name.clone(), cut_text_by_tokens(&result, max_tokens), succeeded)
    }

    async fn record_usage(&self, guild_id: u64, model: &str, usage: TokenUsage, calls: usize) {
        let edit = |settings: &mut GuildSettings| {
            settings.update_usage(model, usage);
            settings.functions_called += calls as u64;
        };
        if let Err(e) = self.settings.update_settings(guild_id, Box::new(edit)).await {
            tracing::warn!(guild_id, "Failed to record token usage: {}", e);
        }
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    async fn key_for(
        &self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
    ) -> Result<(ConversationKey, GuildSettings), AssistantError> {
        let settings = self.settings.get_settings(guild_id).await?;
        let key = ConversationKey::new(user_id, channel_id, guild_id, settings.collab_convos);
        Ok((key, settings))
    }

    pub async fn conversation_stats(
        &self,
        guild_id: u64,
        channel_id: u64,
        requester: &Requester,
    ) -> Result<ConversationStats, AssistantError> {
        let (key, settings) = self.key_for(guild_id, channel_id, requester.user_id).await?;
        let mut conversation = self.conversations.snapshot(&key);
        conversation.cleanup(retention_for(&settings, requester));

        Ok(ConversationStats {
            messages: conversation.messages.len(),
            function_results: conversation.function_count(),
            tokens: conversation.token_count(),
            max_tokens: max_conversation_tokens(&settings, requester),
            max_retention: settings.get_user_max_retention(requester),
            max_time: settings.get_user_max_time(requester),
            model: settings.get_user_model(requester),
        })
    }

    pub async fn reset_conversation(
        &self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
    ) -> Result<(), AssistantError> {
        let (key, _) = self.key_for(guild_id, channel_id, user_id).await?;
        self.conversations.reset(&key);
        Ok(())
    }

    /// Content of the newest message in the conversation, for `--last`.
    pub async fn last_message(
        &self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
    ) -> Result<Option<String>, AssistantError> {
        let (key, _) = self.key_for(guild_id, channel_id, user_id).await?;
        Ok(self
            .conversations
            .snapshot(&key)
            .messages
            .last()
            .map(|m| m.content.clone()))
    }

    pub fn clear_guild(&self, guild_id: u64) -> usize {
        let removed = self.conversations.clear_guild(guild_id);
        if removed > 0 {
            tracing::info!(guild_id, removed, "Cleared guild conversations");
        }
        removed
    }

    /// Drops expired and empty conversations. Each guild is swept with the
    /// longest retention time any of its members could have.
    pub async fn sweep(&self) -> usize {
        let mut removed = 0;
        for guild_id in self.conversations.guild_ids() {
            let settings = match self.settings.get_settings(guild_id).await {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(guild_id, "Skipping sweep, settings unavailable: {}", e);
                    continue;
                }
            };
            let overrides = settings.max_time_role_override.values().copied();
            let longest = if settings.max_retention_time == 0
                || settings.max_time_role_override.values().any(|t| *t == 0)
            {
                0
            } else {
                overrides.fold(settings.max_retention_time, u64::max)
            };
            removed += self.conversations.purge_guild_stale(guild_id, longest);
        }
        removed
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    async fn persistent_guilds(&self, guild_ids: Vec<u64>) -> Vec<u64> {
        let mut keep = Vec::new();
        for guild_id in guild_ids {
            match self.settings.get_settings(guild_id).await {
                Ok(settings) if settings.persistent_conversations => keep.push(guild_id),
                Ok(_) => {}
                Err(e) => tracing::warn!(guild_id, "Settings unavailable: {}", e),
            }
        }
        keep
    }

    /// Rewrites the archive with the conversations of every guild that has
    /// persistence on. Returns how many were written.
    pub async fn persist_conversations(&self) -> Result<usize, AssistantError> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let keep = self.persistent_guilds(self.conversations.guild_ids()).await;
        let saved = self.conversations.export(|guild_id| keep.contains(&guild_id));
        archive.save(&saved).await?;
        Ok(saved.len())
    }

    /// Loads archived conversations for guilds that still have persistence on.
    pub async fn restore_conversations(&self) -> Result<usize, AssistantError> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let saved = archive.load().await?;
        let mut guild_ids: Vec<u64> = saved.iter().map(|s| s.key.guild_id).collect();
        guild_ids.sort_unstable();
        guild_ids.dedup();
        let keep = self.persistent_guilds(guild_ids).await;

        let saved = saved
            .into_iter()
            .filter(|s| keep.contains(&s.key.guild_id))
            .collect();
        let restored = self.conversations.restore(saved);
        tracing::info!(restored, "Restored conversations");
        Ok(restored)
    }

    // ========================================================================
    // EMBEDDINGS
    // ========================================================================

    pub async fn add_embedding(
        &self,
        guild_id: u64,
        name: &str,
        text: &str,
        overwrite: bool,
    ) -> Result<Embedding, AssistantError> {
        let settings = self.settings.get_settings(guild_id).await?;
        if !settings.can_call_llm(self.provider.has_global_endpoint()) {
            return Err(AssistantError::NoApiKey);
        }
        let existing = self.embeddings.get(guild_id, name).await?;
        if existing.is_some() && !overwrite {
            return Err(AssistantError::EmbeddingExists(name.to_string()));
        }

        let reply = self.provider.embed(text, &endpoint_for(&settings)).await?;
        if reply.vector.is_empty() {
            return Err(AssistantError::MalformedResponse(
                "embedding endpoint returned an empty vector".to_string(),
            ));
        }

        let mut entry = Embedding::new(name, text, reply.vector);
        if let Some(old) = existing {
            entry.created_at = old.created_at;
        }
        self.embeddings.upsert(guild_id, entry.clone()).await?;
        tracing::info!(guild_id, name, dimensions = entry.vector.len(), "Saved embedding");
        Ok(entry)
    }

    pub async fn delete_embedding(&self, guild_id: u64, name: &str) -> Result<(), AssistantError> {
        if self.embeddings.delete(guild_id, name).await? {
            Ok(())
        } else {
            Err(AssistantError::EmbeddingNotFound(name.to_string()))
        }
    }

    pub async fn list_embeddings(&self, guild_id: u64) -> Result<Vec<Embedding>, AssistantError> {
        Ok(self.embeddings.list(guild_id).await?)
    }

    /// What a query would pull in, using the guild's `top_n` and threshold.
    pub async fn search_embeddings(
        &self,
        guild_id: u64,
        query: &str,
    ) -> Result<Vec<RelatedEmbedding>, AssistantError> {
        let settings = self.settings.get_settings(guild_id).await?;
        if !settings.can_call_llm(self.provider.has_global_endpoint()) {
            return Err(AssistantError::NoApiKey);
        }
        let reply = self.provider.embed(query, &endpoint_for(&settings)).await?;
        let entries = self.embeddings.list(guild_id).await?;
        Ok(get_related_embeddings(
            &entries,
            &reply.vector,
            settings.top_n.max(1),
            settings.min_relatedness,
        ))
    }

    /// Stores entries that already carry vectors (JSON imports). Existing
    /// names are skipped unless `overwrite`. Returns how many were stored.
    pub async fn import_embeddings(
        &self,
        guild_id: u64,
        entries: Vec<Embedding>,
        overwrite: bool,
    ) -> Result<usize, AssistantError> {
        let mut imported = 0;
        for entry in entries {
            if !overwrite && self.embeddings.get(guild_id, &entry.name).await?.is_some() {
                continue;
            }
            self.embeddings.upsert(guild_id, entry).await?;
            imported += 1;
        }
        tracing::info!(guild_id, imported, "Imported embeddings");
        Ok(imported)
    }

    /// Embeds and stores `name,text` rows (CSV imports).
    pub async fn import_texts(
        &self,
        guild_id: u64,
        rows: Vec<TextRow>,
        overwrite: bool,
    ) -> Result<usize, AssistantError> {
        let mut imported = 0;
        for row in rows {
            match self
                .add_embedding(guild_id, row.name.trim(), &row.text, overwrite)
                .await
            {
                Ok(_) => imported += 1,
                Err(AssistantError::EmbeddingExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(imported)
    }

    pub async fn reset_embeddings(&self, guild_id: u64) -> Result<u64, AssistantError> {
        let removed = self.embeddings.clear(guild_id).await?;
        tracing::info!(guild_id, removed, "Reset embeddings");
        Ok(removed)
    }

    /// Re-embeds entries whose dimensions don't match the current embedding
    /// model, using the first entry as the sample. Returns how many changed.
    pub async fn resync_embeddings(&self, guild_id: u64) -> Result<usize, AssistantError> {
        let entries = self.embeddings.list(guild_id).await?;
        let Some(sample) = entries.first() else {
            return Ok(0);
        };
        let settings = self.settings.get_settings(guild_id).await?;
        let endpoint = endpoint_for(&settings);
        let dimensions = self.provider.embed(&sample.text, &endpoint).await?.vector.len();

        let mut synced = 0;
        for mut entry in entries {
            if entry.vector.len() == dimensions {
                continue;
            }
            entry.vector = self.provider.embed(&entry.text, &endpoint).await?.vector;
            entry.modified_at = Utc::now().timestamp();
            tracing::debug!(guild_id, name = %entry.name, "Updating embedding");
            self.embeddings.upsert(guild_id, entry).await?;
            synced += 1;
        }
        Ok(synced)
    }

    async fn complete_once(
        &self,
        settings: &GuildSettings,
        instructions: &str,
        text: &str,
    ) -> Result<String, AssistantError> {
        let request = ChatRequest {
            model: settings.model.clone(),
            messages: vec![ChatMessage::system(instructions), ChatMessage::user(text)],
            functions: Vec::new(),
            temperature: settings.temperature,
            max_tokens: None,
        };
        let reply = self
            .provider
            .chat_complete(&request, &endpoint_for(settings))
            .await?;
        reply
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AssistantError::MalformedResponse("empty completion".to_string()))
    }

    /// Summarises a message into a new AI-created embedding and names it.
    /// Returns the name.
    pub async fn remember(&self, guild_id: u64, text: &str) -> Result<String, AssistantError> {
        let settings = self.settings.get_settings(guild_id).await?;
        if !settings.can_call_llm(self.provider.has_global_endpoint()) {
            return Err(AssistantError::NoApiKey);
        }

        let summary = self.complete_once(&settings, REACT_SUMMARY_MESSAGE, text).await?;
        let name = self.complete_once(&settings, REACT_NAME_MESSAGE, &summary).await?;
        let name: String = name.trim_matches(['"', '\'']).chars().take(100).collect();

        if self.embeddings.get(guild_id, &name).await?.is_some() {
            return Err(AssistantError::EmbeddingExists(name));
        }

        let reply = self.provider.embed(&summary, &endpoint_for(&settings)).await?;
        let mut entry = Embedding::new(&name, summary, reply.vector);
        entry.ai_created = true;
        self.embeddings.upsert(guild_id, entry).await?;

        tracing::info!(guild_id, name = %name, "Remembered message");
        Ok(name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::assistant::functions::{AssistantFunction, FunctionSchema};
    use crate::core::assistant::memory::tests::{keyword_vector, MemoryEmbeddingStore};
    use crate::core::assistant::provider::{ChatReply, EmbeddingReply};
    use crate::core::assistant::conversation::SavedConversation;
    use crate::core::assistant::settings_store::{SettingsEdit, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemorySettingsStore {
        settings: RwLock<HashMap<u64, GuildSettings>>,
    }

    #[async_trait]
    impl SettingsStore for MemorySettingsStore {
        async fn get_settings(&self, guild_id: u64) -> Result<GuildSettings, StoreError> {
            Ok(self
                .settings
                .read()
                .await
                .get(&guild_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn save_settings(
            &self,
            guild_id: u64,
            settings: GuildSettings,
        ) -> Result<(), StoreError> {
            self.settings.write().await.insert(guild_id, settings);
            Ok(())
        }

        async fn update_settings(
            &self,
            guild_id: u64,
            edit: SettingsEdit<'_>,
        ) -> Result<(), StoreError> {
            let mut settings = self.settings.write().await;
            edit(settings.entry(guild_id).or_default());
            Ok(())
        }
    }

    /// Replays queued replies, then repeats `fallback` forever.
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<ChatReply>>,
        fallback: ChatReply,
        pub requests: Mutex<Vec<ChatRequest>>,
        pub embeds: Mutex<usize>,
        global: bool,
    }

    impl ScriptedProvider {
        pub fn new(replies: Vec<ChatReply>, fallback: ChatReply) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                fallback,
                requests: Mutex::new(Vec::new()),
                embeds: Mutex::new(0),
                global: true,
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat_complete(
            &self,
            request: &ChatRequest,
            _endpoint: &EndpointConfig,
        ) -> Result<ChatReply, AssistantError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.replies.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| self.fallback.clone()))
        }

        async fn embed(
            &self,
            text: &str,
            _endpoint: &EndpointConfig,
        ) -> Result<EmbeddingReply, AssistantError> {
            *self.embeds.lock().unwrap() += 1;
            Ok(EmbeddingReply {
                vector: keyword_vector(text),
                ..Default::default()
            })
        }

        fn has_global_endpoint(&self) -> bool {
            self.global
        }
    }

    fn text(content: &str) -> ChatReply {
        ChatReply {
            content: Some(content.to_string()),
            usage: TokenUsage {
                total: 10,
                prompt: 8,
                completion: 2,
            },
            ..Default::default()
        }
    }

    fn calls(name: &str, arguments: &str) -> ChatReply {
        ChatReply {
            function_calls: vec![FunctionCall {
                id: Some(format!("call_{}", name)),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            ..Default::default()
        }
    }

    struct Ping;

    #[async_trait]
    impl AssistantFunction for Ping {
        fn schema(&self) -> FunctionSchema {
            FunctionSchema {
                name: "ping".into(),
                description: "Returns pong".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn call(
            &self,
            _args: Value,
            _ctx: &FunctionContext,
        ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            Ok("pong".into())
        }
    }

    struct Broken;

    #[async_trait]
    impl AssistantFunction for Broken {
        fn schema(&self) -> FunctionSchema {
            FunctionSchema {
                name: "broken".into(),
                description: "Always fails".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn call(
            &self,
            _args: Value,
            _ctx: &FunctionContext,
        ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            Err("database on fire".into())
        }
    }

    struct Harness {
        service: AssistantService,
        provider: Arc<ScriptedProvider>,
        embeddings: Arc<MemoryEmbeddingStore>,
    }

    async fn harness(provider: ScriptedProvider, settings: GuildSettings) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(MemorySettingsStore::default());
        store.save_settings(1, settings).await.unwrap();
        let embeddings = Arc::new(MemoryEmbeddingStore::default());
        let service = AssistantService::new(provider.clone(), store, embeddings.clone());
        service.functions().register("Tests", Arc::new(Ping)).unwrap();
        service.functions().register("Tests", Arc::new(Broken)).unwrap();
        Harness {
            service,
            provider,
            embeddings,
        }
    }

    fn with_functions() -> GuildSettings {
        GuildSettings {
            use_function_calls: true,
            max_function_calls: 3,
            ..Default::default()
        }
    }

    fn input(message: &str) -> ChatInput {
        ChatInput {
            guild_id: 1,
            channel_id: 10,
            requester: Requester {
                user_id: 100,
                ..Default::default()
            },
            message: message.to_string(),
            context: PromptContext {
                bot_name: "Vert".into(),
                username: "alice".into(),
                guild_name: "Test Server".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn plain_chat_records_history_and_usage() {
        let h = harness(
            ScriptedProvider::new(vec![text("Hello there!")], text("unused")),
            GuildSettings::default(),
        )
        .await;

        let outcome = h.service.chat(input("hi bot")).await.unwrap();
        assert_eq!(outcome.reply, "Hello there!");
        assert_eq!(outcome.function_calls, 0);

        let request = &h.provider.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].content.contains("Vert"));
        assert!(request.messages[1].content.contains("Test Server"));
        assert_eq!(request.messages.last().unwrap().content, "hi bot");
        assert!(request.functions.is_empty());

        let stats = h
            .service
            .conversation_stats(1, 10, &input("").requester)
            .await
            .unwrap();
        assert_eq!(stats.messages, 2);

        let settings = h.service.settings(1).await.unwrap();
        assert_eq!(settings.usage["gpt-4o-mini"].total, 10);

        let last = h.service.last_message(1, 10, 100).await.unwrap();
        assert_eq!(last.as_deref(), Some("Hello there!"));
    }

    #[tokio::test]
    async fn function_loop_stops_at_max_calls() {
        let h = harness(
            ScriptedProvider::new(vec![], calls("ping", "{}")),
            with_functions(),
        )
        .await;

        let err = h.service.chat(input("loop forever")).await.unwrap_err();
        assert!(matches!(err, AssistantError::FunctionLoopExhausted(3)));

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 4);
        assert!(!requests[2].functions.is_empty());
        assert!(requests[3].functions.is_empty());

        let settings = h.service.settings(1).await.unwrap();
        assert_eq!(settings.functions_called, 3);
    }

    #[tokio::test]
    async fn function_result_is_fed_back() {
        let h = harness(
            ScriptedProvider::new(vec![calls("ping", "{}"), text("It said pong")], text("unused")),
            with_functions(),
        )
        .await;

        let outcome = h.service.chat(input("ping it please")).await.unwrap();
        assert_eq!(outcome.reply, "It said pong");
        assert_eq!(outcome.function_calls, 1);
        assert!(!outcome.memory_touched);

        let second = &h.provider.requests()[1];
        let result = second.messages.last().unwrap();
        assert_eq!(result.role, Role::Tool);
        assert_eq!(result.content, "pong");
        assert_eq!(result.tool_call_id.as_deref(), Some("call_ping"));
    }

    #[tokio::test]
    async fn bad_calls_are_reported_back_to_the_model() {
        let h = harness(
            ScriptedProvider::new(
                vec![
                    calls("nope", "{}"),
                    calls("ping", "{not json"),
                    calls("broken", "{}"),
                    text("giving up"),
                ],
                text("unused"),
            ),
            GuildSettings {
                max_function_calls: 5,
                ..with_functions()
            },
        )
        .await;

        h.service.chat(input("try things")).await.unwrap();
        let requests = h.provider.requests();

        let unknown = requests[1].messages.last().unwrap();
        assert_eq!(unknown.content, "nope is not a valid function name");
        assert_eq!(unknown.name.as_deref(), Some("invalid_function"));

        let bad_json = requests[2].messages.last().unwrap();
        assert!(bad_json.content.starts_with("JSONDecodeError"));

        let failed = requests[3].messages.last().unwrap();
        assert!(failed.content.contains("database on fire"));
        assert!(requests[3].functions.iter().all(|f| f.name != "broken"));
    }

    #[tokio::test]
    async fn no_endpoint_means_no_call() {
        let mut provider = ScriptedProvider::new(vec![], text("unused"));
        provider.global = false;
        let h = harness(provider, GuildSettings::default()).await;

        let err = h.service.chat(input("hello there")).await.unwrap_err();
        assert!(matches!(err, AssistantError::NoApiKey));
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn related_embeddings_reach_the_system_prompt() {
        let h = harness(
            ScriptedProvider::new(vec![], text("Cats are great")),
            GuildSettings {
                min_relatedness: 0.5,
                ..Default::default()
            },
        )
        .await;
        h.embeddings
            .upsert(1, Embedding::new("cats", "The server cat is named Tom", keyword_vector("cat")))
            .await
            .unwrap();
        h.embeddings
            .upsert(1, Embedding::new("dogs", "Nobody here owns a dog", keyword_vector("dog")))
            .await
            .unwrap();

        h.service.chat(input("what is the cat called?")).await.unwrap();

        let system = &h.provider.requests()[0].messages[0].content;
        assert!(system.contains("# RELATED EMBEDDINGS"));
        assert!(system.contains("named Tom"));
        assert!(!system.contains("owns a dog"));
    }

    #[tokio::test]
    async fn question_mode_skips_embedding_statements() {
        let h = harness(
            ScriptedProvider::new(vec![], text("ok")),
            GuildSettings {
                question_mode: true,
                ..Default::default()
            },
        )
        .await;
        h.embeddings
            .upsert(1, Embedding::new("cats", "cat facts", keyword_vector("cat")))
            .await
            .unwrap();

        // First message always embeds
        h.service.chat(input("tell me cat facts")).await.unwrap();
        assert_eq!(*h.provider.embeds.lock().unwrap(), 1);
        // Later statements don't, questions do
        h.service.chat(input("that is neat")).await.unwrap();
        assert_eq!(*h.provider.embeds.lock().unwrap(), 1);
        h.service.chat(input("anything else about cats?")).await.unwrap();
        assert_eq!(*h.provider.embeds.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn blacklist_filters_reply() {
        let h = harness(
            ScriptedProvider::new(vec![], text("As an AI language model, I like tea")),
            GuildSettings {
                regex_blacklist: vec![r"^As an AI language model,\s*".into()],
                ..Default::default()
            },
        )
        .await;
        let outcome = h.service.chat(input("do you like tea")).await.unwrap();
        assert_eq!(outcome.reply, "I like tea");

        h.service
            .update_settings(1, |s| {
                s.regex_blacklist = vec!["(broken".into()];
                s.block_failed_regex = true;
            })
            .await
            .unwrap();
        let outcome = h.service.chat(input("do you like tea")).await.unwrap();
        assert_eq!(outcome.reply, BLOCKED_REPLY);
    }

    #[tokio::test]
    async fn tutors_can_create_memories() {
        let mut settings = with_functions();
        settings.tutors = vec![100];
        let h = harness(
            ScriptedProvider::new(
                vec![
                    calls(
                        "create_memory",
                        r#"{"memory_name": "pets", "memory_text": "Alice has a cat"}"#,
                    ),
                    text("Got it!"),
                ],
                text("unused"),
            ),
            settings,
        )
        .await;

        let outcome = h.service.chat(input("remember I have a cat")).await.unwrap();
        assert!(outcome.memory_touched);
        let saved = h.embeddings.get(1, "pets").await.unwrap().unwrap();
        assert!(saved.ai_created);
        assert!(h.provider.requests()[0]
            .functions
            .iter()
            .any(|f| f.name == "create_memory"));
    }

    #[tokio::test]
    async fn remember_summarises_and_names() {
        let h = harness(
            ScriptedProvider::new(
                vec![text("The owner keeps a cat named Tom"), text("\"Owner's cat\"")],
                text("unused"),
            ),
            GuildSettings::default(),
        )
        .await;

        let name = h.service.remember(1, "my cat tom is the best").await.unwrap();
        assert_eq!(name, "Owner's cat");
        let saved = h.embeddings.get(1, "Owner's cat").await.unwrap().unwrap();
        assert_eq!(saved.text, "The owner keeps a cat named Tom");
        assert!(saved.ai_created);
    }

    #[tokio::test]
    async fn embedding_admin_operations() {
        let h = harness(ScriptedProvider::new(vec![], text("unused")), GuildSettings::default())
            .await;

        h.service.add_embedding(1, "cats", "cats purr", false).await.unwrap();
        let err = h.service.add_embedding(1, "cats", "again", false).await.unwrap_err();
        assert!(matches!(err, AssistantError::EmbeddingExists(_)));
        h.service.add_embedding(1, "cats", "cats meow", true).await.unwrap();
        assert_eq!(h.service.list_embeddings(1).await.unwrap()[0].text, "cats meow");

        let hits = h.service.search_embeddings(1, "a cat question").await.unwrap();
        assert_eq!(hits[0].name, "cats");

        // Stale dimensions get re-embedded
        h.embeddings
            .upsert(1, Embedding::new("old", "old dog text", vec![1.0]))
            .await
            .unwrap();
        assert_eq!(h.service.resync_embeddings(1).await.unwrap(), 1);
        assert_eq!(h.embeddings.get(1, "old").await.unwrap().unwrap().vector.len(), 3);

        let err = h.service.delete_embedding(1, "missing").await.unwrap_err();
        assert!(matches!(err, AssistantError::EmbeddingNotFound(_)));
        h.service.delete_embedding(1, "cats").await.unwrap();
        assert_eq!(h.service.reset_embeddings(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn collab_mode_shares_history() {
        let h = harness(
            ScriptedProvider::new(vec![], text("sure")),
            GuildSettings {
                collab_convos: true,
                ..Default::default()
            },
        )
        .await;

        h.service.chat(input("first message")).await.unwrap();
        let mut other = input("second message");
        other.requester.user_id = 200;
        h.service.chat(other).await.unwrap();

        // The second member's request carries the first member's turn
        let second = &h.provider.requests()[1];
        assert!(second.messages.iter().any(|m| m.content == "first message"));

        h.service.reset_conversation(1, 10, 200).await.unwrap();
        assert_eq!(h.service.last_message(1, 10, 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sweep_and_guild_clear() {
        let h = harness(ScriptedProvider::new(vec![], text("hey")), GuildSettings::default())
            .await;
        h.service.chat(input("hello there")).await.unwrap();
        assert_eq!(h.service.conversation_count(), 1);

        // Fresh conversations survive the sweep
        assert_eq!(h.service.sweep().await, 0);
        assert_eq!(h.service.clear_guild(1), 1);
        assert_eq!(h.service.conversation_count(), 0);
    }

    #[tokio::test]
    async fn huge_messages_skip_the_query_embedding() {
        let h = harness(ScriptedProvider::new(vec![], text("ok")), GuildSettings::default())
            .await;
        h.embeddings
            .upsert(1, Embedding::new("cats", "cat facts", keyword_vector("cat")))
            .await
            .unwrap();

        let upload = format!("read this file {}", "word ".repeat(40_000));
        assert!(estimate_tokens(&upload) >= MAX_EMBED_TOKENS);
        assert!(!AssistantService::should_embed(
            &GuildSettings::default(),
            1,
            &upload,
            true
        ));

        // Too big for this guild's budget either way, but never sent to /embeddings
        let _ = h.service.chat(input(&upload)).await;
        assert_eq!(*h.provider.embeds.lock().unwrap(), 0);

        h.service.chat(input("tell me cat facts")).await.unwrap();
        assert_eq!(*h.provider.embeds.lock().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chats_keep_every_usage_update() {
        let h = harness(ScriptedProvider::new(vec![], text("ok")), GuildSettings::default())
            .await;
        let service = Arc::new(h.service);

        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                let mut turn = input("hello there bot");
                turn.requester.user_id = 100 + i;
                service.chat(turn).await.unwrap();
            }));
        }
        let admin = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            admin.update_settings(1, |s| s.temperature = 0.2).await.unwrap();
        }));
        for task in tasks {
            task.await.unwrap();
        }

        let settings = service.settings(1).await.unwrap();
        assert_eq!(settings.usage["gpt-4o-mini"].total, 200);
        assert_eq!(settings.temperature, 0.2);
    }

    #[tokio::test]
    async fn imports_skip_existing_names_unless_overwriting() {
        let h = harness(ScriptedProvider::new(vec![], text("unused")), GuildSettings::default())
            .await;
        h.embeddings
            .upsert(1, Embedding::new("rules", "old rules", vec![1.0]))
            .await
            .unwrap();

        let entries = vec![
            Embedding::new("rules", "new rules", vec![2.0]),
            Embedding::new("hours", "9 to 5", vec![3.0]),
        ];
        assert_eq!(h.service.import_embeddings(1, entries.clone(), false).await.unwrap(), 1);
        assert_eq!(h.embeddings.get(1, "rules").await.unwrap().unwrap().text, "old rules");
        assert_eq!(h.service.import_embeddings(1, entries, true).await.unwrap(), 2);
        assert_eq!(h.embeddings.get(1, "rules").await.unwrap().unwrap().text, "new rules");

        // CSV rows have no vectors and go through the embedding endpoint
        let rows = vec![
            TextRow {
                name: "hours".into(),
                text: "closed sundays".into(),
            },
            TextRow {
                name: "pets".into(),
                text: "cats allowed".into(),
            },
        ];
        assert_eq!(h.service.import_texts(1, rows, false).await.unwrap(), 1);
        assert_eq!(*h.provider.embeds.lock().unwrap(), 1);
        assert_eq!(h.embeddings.get(1, "pets").await.unwrap().unwrap().vector.len(), 3);
    }

    #[derive(Default)]
    struct MemoryArchive {
        saved: Mutex<Vec<SavedConversation>>,
    }

    #[async_trait]
    impl ConversationArchive for MemoryArchive {
        async fn load(&self) -> Result<Vec<SavedConversation>, StoreError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save(
            &self,
            conversations: &[SavedConversation],
        ) -> Result<(), StoreError> {
            *self.saved.lock().unwrap() = conversations.to_vec();
            Ok(())
        }
    }

    #[tokio::test]
    async fn persistent_guilds_survive_a_restart() {
        let archive = Arc::new(MemoryArchive::default());
        let h = harness(
            ScriptedProvider::new(vec![], text("noted")),
            GuildSettings {
                persistent_conversations: true,
                ..Default::default()
            },
        )
        .await;
        let service = h.service.with_archive(archive.clone());
        service.chat(input("remember this chat")).await.unwrap();

        // Guild 2 never opted in
        let mut elsewhere = input("not kept here");
        elsewhere.guild_id = 2;
        service.chat(elsewhere).await.unwrap();
        assert_eq!(service.conversation_count(), 2);

        assert_eq!(service.persist_conversations().await.unwrap(), 1);

        let restarted = harness(
            ScriptedProvider::new(vec![], text("unused")),
            GuildSettings {
                persistent_conversations: true,
                ..Default::default()
            },
        )
        .await
        .service
        .with_archive(archive.clone());
        assert_eq!(restarted.restore_conversations().await.unwrap(), 1);
        let last = restarted.last_message(1, 10, 100).await.unwrap();
        assert_eq!(last.as_deref(), Some("noted"));

        // With persistence off the archive is ignored
        let fresh = harness(ScriptedProvider::new(vec![], text("unused")), GuildSettings::default())
            .await
            .service
            .with_archive(archive);
        assert_eq!(fresh.restore_conversations().await.unwrap(), 0);
    }
}
