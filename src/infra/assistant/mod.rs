pub mod json_conversation_archive;
pub mod json_settings_store;
pub mod openai_client;
pub mod sqlite_embedding_store;

pub use json_conversation_archive::JsonConversationArchive;
pub use json_settings_store::JsonSettingsStore;
pub use openai_client::OpenAiClient;
pub use sqlite_embedding_store::SqliteEmbeddingStore;
