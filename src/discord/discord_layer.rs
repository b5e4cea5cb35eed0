// Discord layer - commands and event handlers.
//
// Everything here translates between serenity types and the assistant core.
// No chat logic lives in this layer.

#[path = "commands/command_catalog.rs"]
pub mod commands;

#[path = "assistant/mod.rs"]
pub mod assistant;

use crate::core::assistant::AssistantService;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared state handed to every command and event.
pub struct Data {
    pub assistant: Arc<AssistantService>,
    /// Last unexpected error, for the owner's `lasterror` command.
    pub last_error: Mutex<Option<String>>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
