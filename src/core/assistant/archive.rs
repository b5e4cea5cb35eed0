use super::conversation::SavedConversation;
use super::settings_store::StoreError;
use async_trait::async_trait;

/// Disk copy of the conversations of guilds that opted into persistence.
///
/// Every save replaces the whole archive.
#[async_trait]
pub trait ConversationArchive: Send + Sync {
    async fn load(&self) -> Result<Vec<SavedConversation>, StoreError>;
    async fn save(&self, conversations: &[SavedConversation]) -> Result<(), StoreError>;
}
