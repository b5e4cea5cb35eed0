use crate::core::assistant::{GuildSettings, SettingsEdit, SettingsStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Every guild's settings in one JSON file: `{ guild_id: GuildSettings }`.
/// Reads come from the cache; every write rewrites the file while still
/// holding the cache's write lock, so the file always matches the cache.
pub struct JsonSettingsStore {
    path: PathBuf,
    cache: RwLock<HashMap<u64, GuildSettings>>,
}

/// Where an unreadable settings file gets moved before we start over.
fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".corrupt-{}", Utc::now().timestamp()));
    PathBuf::from(name)
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cache: HashMap<u64, GuildSettings> = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            match serde_json::from_reader(reader) {
                Ok(cache) => cache,
                Err(e) => {
                    // Keep the bad file around, the next save would overwrite it
                    let aside = quarantine_path(&path);
                    std::fs::rename(&path, &aside)?;
                    tracing::error!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        "Settings file unreadable, starting fresh: {}",
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        tracing::info!(guilds = cache.len(), "Loaded assistant settings");
        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    fn persist(&self, cache: &HashMap<u64, GuildSettings>) -> Result<(), StoreError> {
        let file = File::create(&self.path)?;
        serde_json::to_writer_pretty(file, cache)?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get_settings(&self, guild_id: u64) -> Result<GuildSettings, StoreError> {
        let cache = self.cache.read().await;
        Ok(cache.get(&guild_id).cloned().unwrap_or_default())
    }

    async fn save_settings(&self, guild_id: u64, settings: GuildSettings) -> Result<(), StoreError> {
        let mut cache = self.cache.write().await;
        cache.insert(guild_id, settings);
        self.persist(&cache)
    }

    async fn update_settings(
        &self,
        guild_id: u64,
        edit: SettingsEdit<'_>,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.write().await;
        edit(cache.entry(guild_id).or_default());
        self.persist(&cache)
    }
}
