use super::models::GuildSettings;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(String),
}

/// An in-place edit of one guild's settings.
pub type SettingsEdit<'a> = Box<dyn FnOnce(&mut GuildSettings) + Send + 'a>;

/// Persistence for per-guild assistant settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Settings for a guild, or the defaults if it was never configured.
    async fn get_settings(&self, guild_id: u64) -> Result<GuildSettings, StoreError>;
    async fn save_settings(&self, guild_id: u64, settings: GuildSettings)
        -> Result<(), StoreError>;
    /// Applies `edit` and persists the result without letting another write
    /// land in between.
    async fn update_settings(&self, guild_id: u64, edit: SettingsEdit<'_>)
        -> Result<(), StoreError>;
}
