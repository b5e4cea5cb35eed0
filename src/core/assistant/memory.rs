// Built-in memory functions.
//
// These let the model manage the guild's embeddings itself. Gating (tutors
// only, embeddings required) happens in `FunctionRegistry::prepare`.

use super::embeddings::{get_related_embeddings, Embedding, EmbeddingStore};
use super::functions::{AssistantFunction, FunctionContext, FunctionSchema};
use super::provider::ChatProvider;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::error::Error;
use std::sync::Arc;

/// Owner name the memory functions are registered under.
pub const MEMORY_OWNER: &str = "Assistant";

const DEFAULT_SEARCH_AMOUNT: usize = 2;

type FnResult = Result<String, Box<dyn Error + Send + Sync>>;

/// Handles shared by every memory function.
#[derive(Clone)]
pub struct MemoryTools {
    provider: Arc<dyn ChatProvider>,
    embeddings: Arc<dyn EmbeddingStore>,
}

impl MemoryTools {
    pub fn new(provider: Arc<dyn ChatProvider>, embeddings: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            provider,
            embeddings,
        }
    }

    /// All four memory functions, ready to register.
    pub fn functions(&self) -> Vec<Arc<dyn AssistantFunction>> {
        vec![
            Arc::new(CreateMemory(self.clone())),
            Arc::new(EditMemory(self.clone())),
            Arc::new(SearchMemories(self.clone())),
            Arc::new(ListMemories(self.clone())),
        ]
    }
}

#[derive(Deserialize)]
struct MemoryArgs {
    memory_name: String,
    memory_text: String,
}

#[derive(Deserialize)]
struct SearchArgs {
    search_query: String,
    amount: Option<usize>,
}

fn memory_parameters(name_desc: &str, text_desc: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "memory_name": {"type": "string", "description": name_desc},
            "memory_text": {"type": "string", "description": text_desc}
        },
        "required": ["memory_name", "memory_text"]
    })
}

pub struct CreateMemory(MemoryTools);

#[async_trait]
impl AssistantFunction for CreateMemory {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: "create_memory".to_string(),
            description: "Use this when someone corrects you, tells you something new, or tells you to remember something.".to_string(),
            parameters: memory_parameters(
                "A short name to describe the memory, preferably less than 50 characters or 3 words tops",
                "The information to remember, write as if you are informing yourself of the thing to remember.",
            ),
        }
    }

    async fn call(&self, args: Value, ctx: &FunctionContext) -> FnResult {
        let args: MemoryArgs = serde_json::from_value(args)?;
        let tools = &self.0;

        if tools.embeddings.get(ctx.guild_id, &args.memory_name).await?.is_some() {
            return Ok(format!(
                "A memory with the name '{}' already exists, use edit_memory to change it.",
                args.memory_name
            ));
        }

        let reply = tools.provider.embed(&args.memory_text, &ctx.endpoint).await?;
        if reply.vector.is_empty() {
            return Ok("Failed to embed the memory text, try again later.".to_string());
        }

        let mut entry = Embedding::new(&args.memory_name, &args.memory_text, reply.vector);
        entry.ai_created = true;
        tools.embeddings.upsert(ctx.guild_id, entry).await?;

        tracing::info!(guild_id = ctx.guild_id, name = %args.memory_name, "Model created a memory");
        Ok(format!("Your memory '{}' has been saved!", args.memory_name))
    }
}

pub struct EditMemory(MemoryTools);

#[async_trait]
impl AssistantFunction for EditMemory {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: "edit_memory".to_string(),
            description: "Use this to edit existing memories, useful for correcting inaccurate memories after making them".to_string(),
            parameters: memory_parameters(
                "The name of the memory entry, case sensitive",
                "The new text that will replace the current content of the memory",
            ),
        }
    }

    async fn call(&self, args: Value, ctx: &FunctionContext) -> FnResult {
        let args: MemoryArgs = serde_json::from_value(args)?;
        let tools = &self.0;

        let Some(mut entry) = tools.embeddings.get(ctx.guild_id, &args.memory_name).await? else {
            return Ok(format!("No memory named '{}' exists!", args.memory_name));
        };

        let reply = tools.provider.embed(&args.memory_text, &ctx.endpoint).await?;
        if reply.vector.is_empty() {
            return Ok("Failed to embed the memory text, try again later.".to_string());
        }

        entry.text = args.memory_text;
        entry.vector = reply.vector;
        entry.ai_created = true;
        entry.modified_at = chrono::Utc::now().timestamp();
        tools.embeddings.upsert(ctx.guild_id, entry).await?;

        tracing::info!(guild_id = ctx.guild_id, name = %args.memory_name, "Model edited a memory");
        Ok(format!("Your memory '{}' has been updated!", args.memory_name))
    }
}

pub struct SearchMemories(MemoryTools);

#[async_trait]
impl AssistantFunction for SearchMemories {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: "search_memories".to_string(),
            description: "Use this to find information about something, always use this if you are unsure about the answer to a question".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "search_query": {
                        "type": "string",
                        "description": "the keyword or query you want to find information about"
                    },
                    "amount": {
                        "type": "integer",
                        "description": "Max amount of memories to fetch. Defaults to 2"
                    }
                },
                "required": ["search_query"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &FunctionContext) -> FnResult {
        let args: SearchArgs = serde_json::from_value(args)?;
        let tools = &self.0;

        let reply = tools.provider.embed(&args.search_query, &ctx.endpoint).await?;
        let entries = tools.embeddings.list(ctx.guild_id).await?;
        let related = get_related_embeddings(
            &entries,
            &reply.vector,
            args.amount.unwrap_or(DEFAULT_SEARCH_AMOUNT).max(1),
            ctx.settings.min_relatedness,
        );

        if related.is_empty() {
            return Ok("No memories related to that query were found".to_string());
        }

        let found = related
            .iter()
            .map(|r| format!("{}: {}", r.name, r.text))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(found)
    }
}

pub struct ListMemories(MemoryTools);

#[async_trait]
impl AssistantFunction for ListMemories {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: "list_memories".to_string(),
            description: "Get a list of all your available memories".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _args: Value, ctx: &FunctionContext) -> FnResult {
        let entries = self.0.embeddings.list(ctx.guild_id).await?;
        if entries.is_empty() {
            return Ok("You have no memories available!".to_string());
        }
        Ok(entries
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", "))
    }
}
