use crate::core::assistant::{ConversationArchive, SavedConversation, StoreError};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

/// Archived conversations as one JSON array. Saves go through a temp file
/// so a crash mid-write leaves the previous archive intact.
pub struct JsonConversationArchive {
    path: PathBuf,
}

impl JsonConversationArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConversationArchive for JsonConversationArchive {
    async fn load(&self) -> Result<Vec<SavedConversation>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        match serde_json::from_reader(reader) {
            Ok(saved) => Ok(saved),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Conversation archive unreadable: {}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, conversations: &[SavedConversation]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, conversations)?;
        writer.flush()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assistant::conversation::Conversation;
    use crate::core::assistant::{ConversationKey, Role};
    use tempfile::tempdir;

    #[tokio::test]
    async fn archive_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let archive = JsonConversationArchive::new(dir.path().join("conversations.json"));
        assert!(archive.load().await.unwrap().is_empty());

        let mut conversation = Conversation::default();
        conversation.update_messages("hello", Role::User, Some("alice".into()));
        let saved = SavedConversation {
            key: ConversationKey::new(1, 2, 3, false),
            conversation,
        };
        archive.save(&[saved.clone(), saved]).await.unwrap();
        assert_eq!(archive.load().await.unwrap().len(), 2);

        archive.save(&[]).await.unwrap();
        assert!(archive.load().await.unwrap().is_empty());
        assert!(!dir.path().join("conversations.json.tmp").exists());
    }
}
