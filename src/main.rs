// Entry point of the assistant bot.
//
// **Architecture Overview:**
// - `core/` = Assistant logic (platform-agnostic)
// - `infra/` = Implementations of core traits (settings and conversation files,
//   SQLite, HTTP API)
// - `discord/` = Discord-specific adapters (commands, events)
//
// This file loads configuration, wires the services together, sets up the
// poise framework and starts the conversation sweeper.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::assistant::AssistantService;
use crate::discord::assistant::listener;
use crate::discord::{Data, Error};
use crate::infra::assistant::{
    JsonConversationArchive, JsonSettingsStore, OpenAiClient, SqliteEmbeddingStore,
};
use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_SWEEP_SECS: u64 = 300;

/// Event handler for non-command Discord events.
async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if let Err(e) = listener::handle_message(ctx, framework, data, new_message).await {
                tracing::error!("Error answering in the assistant channel: {}", e);
            }
        }
        serenity::FullEvent::ReactionAdd { add_reaction } => {
            if let Err(e) = listener::handle_reaction(ctx, data, add_reaction).await {
                tracing::error!("Error handling memory reaction: {}", e);
            }
        }
        serenity::FullEvent::GuildDelete { incomplete, .. } => {
            listener::handle_guild_delete(data, incomplete);
        }
        _ => {}
    }
    Ok(())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN").context(
        "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
    )?;

    // Keep runtime files in a dedicated folder so the repo root stays tidy.
    let data_dir = env_opt("ASSISTANT_DATA_DIR").unwrap_or_else(|| "data".to_string());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir))?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let settings_store = JsonSettingsStore::new(format!("{}/assistant_settings.json", data_dir))
        .context("Failed to load assistant settings")?;
    let embedding_store =
        SqliteEmbeddingStore::new(&format!("sqlite://{}/embeddings.db?mode=rwc", data_dir))
            .await
            .context("Failed to initialize embeddings database")?;
    let client = OpenAiClient::new(
        env_opt("ASSISTANT_ENDPOINT"),
        env_opt("ASSISTANT_API_KEY"),
        env_opt("ASSISTANT_EMBED_MODEL"),
    )
    .context("Failed to create API client")?;

    let archive = JsonConversationArchive::new(format!("{}/conversations.json", data_dir));

    let assistant = Arc::new(
        AssistantService::new(
            Arc::new(client),
            Arc::new(settings_store),
            Arc::new(embedding_store),
        )
        .with_archive(Arc::new(archive)),
    );
    if let Err(e) = assistant.restore_conversations().await {
        tracing::warn!("Failed to restore saved conversations: {}", e);
    }
    if !assistant.has_global_endpoint() {
        tracing::warn!("No global API key or endpoint set, guilds must configure their own");
    }

    let sweep_every = env_opt("ASSISTANT_SWEEP_SECS")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_SWEEP_SECS);
    let prefix = env_opt("ASSISTANT_PREFIX").unwrap_or_else(|| "!".to_string());

    let data = Data {
        assistant: Arc::clone(&assistant),
        last_error: Mutex::new(None),
    };

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required to read message content
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_MESSAGE_REACTIONS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                discord::commands::chat::chat(),
                discord::commands::chat::convostats(),
                discord::commands::chat::clearconvo(),
                discord::commands::chat::tokens(),
                discord::commands::assistant_admin::assistant(),
                discord::commands::embeddings::embeddings(),
                discord::commands::owner::lasterror(),
            ],
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(prefix),
                ..Default::default()
            },
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            on_error: |error| {
                Box::pin(async move {
                    if let Err(e) = poise::builtins::on_error(error).await {
                        tracing::error!("Error while handling error: {}", e);
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                tracing::info!("🤖 Logged in as {}", ready.user.name);

                // Register slash commands globally (can take up to an hour to propagate)
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!("✅ Commands registered!");

                // Expire idle conversations and archive the persistent ones
                let sweeper = Arc::clone(&data.assistant);
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(sweep_every));
                    loop {
                        interval.tick().await;
                        let removed = sweeper.sweep().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired conversations");
                        }
                        match sweeper.persist_conversations().await {
                            Ok(0) => {}
                            Ok(saved) => tracing::debug!(saved, "Archived conversations"),
                            Err(e) => tracing::warn!("Failed to archive conversations: {}", e),
                        }
                    }
                });

                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .context("Failed to create Discord client")?;

    client.start().await.context("Discord client stopped")?;
    Ok(())
}
