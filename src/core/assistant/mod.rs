// Assistant core - everything the chat pipeline needs that isn't Discord.
//
// Layers, in the order a message flows through them:
// intake -> conversation -> prompt (+ embeddings) -> budget -> provider/functions
// -> filter -> formatting

pub mod archive;
pub mod assistant_service;
pub mod budget;
pub mod conversation;
pub mod embedding_transfer;
pub mod embeddings;
pub mod errors;
pub mod filter;
pub mod formatting;
pub mod functions;
pub mod intake;
pub mod memory;
pub mod models;
pub mod prompt;
pub mod provider;
pub mod settings_store;
pub mod tokens;

pub use archive::ConversationArchive;
pub use assistant_service::{AssistantService, ChatInput, ChatOutcome, ConversationStats};
pub use conversation::{ConversationKey, SavedConversation};
pub use embeddings::{Embedding, EmbeddingStore};
pub use errors::AssistantError;
pub use functions::{AssistantFunction, FunctionContext, FunctionRegistry, FunctionSchema};
pub use models::{ChatMessage, EmbedMethod, GuildSettings, Requester, Role};
pub use prompt::PromptContext;
pub use provider::{ChatProvider, EndpointConfig};
pub use settings_store::{SettingsEdit, SettingsStore, StoreError};
