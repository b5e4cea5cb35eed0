// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "assistant/mod.rs"]
pub mod assistant;
