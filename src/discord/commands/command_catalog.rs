// Discord commands module.
// Each feature gets its own command file.

pub mod chat;

pub mod assistant_admin;

pub mod embeddings;

pub mod owner;
