// =============================================================================
// FUNCTION REGISTRY
// =============================================================================
//
// Functions the model may call. Each one is registered under an owner (the
// module that provided it) so an owner can pull all of its functions at once,
// and a name can only belong to one owner.

use super::models::GuildSettings;
use super::provider::EndpointConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// JSON schema the model sees for a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl FunctionSchema {
    /// Parses and validates a raw schema. The error lists every problem found.
    pub fn from_json(schema: &Value) -> Result<Self, RegistryError> {
        let mut missing = Vec::new();
        if schema.get("name").and_then(Value::as_str).is_none() {
            missing.push("`name`");
        }
        if schema.get("description").and_then(Value::as_str).is_none() {
            missing.push("`description`");
        }
        match schema.get("parameters") {
            None => missing.push("`parameters`"),
            Some(params) => {
                if params.get("type").is_none() {
                    missing.push("`type` in parameters");
                }
                match params.get("properties") {
                    None => missing.push("`properties` in parameters"),
                    Some(props) if props.get("required").is_some() => {
                        missing.push("`required` must be outside of properties")
                    }
                    Some(_) => {}
                }
            }
        }

        if !missing.is_empty() {
            return Err(RegistryError::InvalidSchema(missing.join(", ")));
        }

        serde_json::from_value(schema.clone())
            .map_err(|e| RegistryError::InvalidSchema(e.to_string()))
    }
}

/// What a function gets to know about the call site.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub guild_id: u64,
    pub channel_id: u64,
    pub user_id: u64,
    pub settings: GuildSettings,
    pub endpoint: EndpointConfig,
}

/// A callable the model can invoke.
#[async_trait]
pub trait AssistantFunction: Send + Sync {
    fn schema(&self) -> FunctionSchema;

    /// `args` is the parsed argument object. The returned text goes back to the model.
    async fn call(
        &self,
        args: Value,
        ctx: &FunctionContext,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("Invalid json schema: {0}")]
    InvalidSchema(String),
    #[error("{owner} already registered the function {name}")]
    AlreadyRegistered { owner: String, name: String },
}

struct RegisteredFunction {
    owner: String,
    function: Arc<dyn AssistantFunction>,
}

/// Functions offered to the model for one request.
#[derive(Clone, Default)]
pub struct FunctionSet {
    pub schemas: Vec<FunctionSchema>,
    pub callables: HashMap<String, Arc<dyn AssistantFunction>>,
}

impl FunctionSet {
    /// Stop offering a function (after it failed or doesn't exist).
    pub fn withdraw(&mut self, name: &str) {
        self.schemas.retain(|s| s.name != name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AssistantFunction>> {
        self.callables.get(name).cloned()
    }

    fn remove(&mut self, name: &str) {
        self.withdraw(name);
        self.callables.remove(name);
    }
}

/// Memory functions only tutors may use.
pub const TUTOR_ONLY_FUNCTIONS: &[&str] = &["create_memory", "edit_memory"];
/// Functions that make no sense without any stored embeddings.
pub const NEEDS_EMBEDDINGS_FUNCTIONS: &[&str] = &["edit_memory", "search_memories", "list_memories"];

#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        owner: &str,
        function: Arc<dyn AssistantFunction>,
    ) -> Result<(), RegistryError> {
        let schema = function.schema();
        let raw = serde_json::to_value(&schema)
            .map_err(|e| RegistryError::InvalidSchema(e.to_string()))?;
        FunctionSchema::from_json(&raw)?;

        if let Some(existing) = self.functions.get(&schema.name) {
            if existing.owner != owner {
                return Err(RegistryError::AlreadyRegistered {
                    owner: existing.owner.clone(),
                    name: schema.name,
                });
            }
        }

        tracing::info!(owner, function = %schema.name, "Registered assistant function");
        self.functions.insert(
            schema.name,
            RegisteredFunction {
                owner: owner.to_string(),
                function,
            },
        );
        Ok(())
    }

    pub fn unregister_owner(&self, owner: &str) -> usize {
        let before = self.functions.len();
        self.functions.retain(|_, f| f.owner != owner);
        let removed = before - self.functions.len();
        if removed > 0 {
            tracing::info!(owner, removed, "Removed owner from function registry");
        }
        removed
    }

    pub fn unregister_function(&self, owner: &str, name: &str) -> bool {
        self.functions
            .remove_if(name, |_, f| f.owner == owner)
            .is_some()
    }

    /// (owner, schema) for every registered function, sorted by name.
    pub fn list(&self) -> Vec<(String, FunctionSchema)> {
        let mut all: Vec<(String, FunctionSchema)> = self
            .functions
            .iter()
            .map(|entry| (entry.owner.clone(), entry.function.schema()))
            .collect();
        all.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        all
    }

    /// The functions to offer for one request, after the guild's toggles and
    /// the tutor/embedding gates.
    pub fn prepare(&self, settings: &GuildSettings, is_tutor: bool, has_embeddings: bool) -> FunctionSet {
        let mut set = FunctionSet::default();
        if !settings.use_function_calls {
            return set;
        }

        for entry in self.functions.iter() {
            let name = entry.key();
            if settings.disabled_functions.iter().any(|d| d == name) {
                continue;
            }
            set.schemas.push(entry.function.schema());
            set.callables
                .insert(name.clone(), Arc::clone(&entry.function));
        }
        set.schemas.sort_by(|a, b| a.name.cmp(&b.name));

        if !is_tutor {
            for name in TUTOR_ONLY_FUNCTIONS {
                set.remove(name);
            }
        }
        if !has_embeddings {
            for name in NEEDS_EMBEDDINGS_FUNCTIONS {
                set.remove(name);
            }
        }
        set
    }
}
