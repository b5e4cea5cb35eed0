use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// CHAT MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Legacy single function result.
    Function,
    /// Tool call result, paired with `tool_call_id`.
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::Tool => "tool",
        }
    }
}

/// A function call the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool call id. `None` for the legacy `function_call` format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Raw JSON arguments, exactly as the model produced them.
    pub arguments: String,
}

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Assistant turn that only carries function calls.
    pub fn function_request(calls: Vec<FunctionCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            function_calls: calls,
            tool_call_id: None,
        }
    }

    /// Result of a function call. Tool calls answer with `tool`, legacy calls with `function`.
    pub fn function_result(call: &FunctionCall, name: &str, content: impl Into<String>) -> Self {
        Self {
            role: if call.id.is_some() {
                Role::Tool
            } else {
                Role::Function
            },
            content: content.into(),
            name: Some(name.to_string()),
            function_calls: Vec::new(),
            tool_call_id: call.id.clone(),
        }
    }

    pub fn is_function_result(&self) -> bool {
        matches!(self.role, Role::Function | Role::Tool)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.total = self.total.saturating_add(other.total);
        self.prompt = self.prompt.saturating_add(other.prompt);
        self.completion = self.completion.saturating_add(other.completion);
    }
}

// ============================================================================
// REQUESTER
// ============================================================================

/// Who is talking to the assistant, reduced to what the core needs.
#[derive(Debug, Clone, Default)]
pub struct Requester {
    pub user_id: u64,
    /// Role ids ordered from highest to lowest position.
    pub role_ids: Vec<u64>,
    pub is_guild_owner: bool,
}

// ============================================================================
// GUILD SETTINGS
// ============================================================================

/// Where related embeddings get injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMethod {
    /// Appended to the system prompt.
    #[default]
    Dynamic,
    /// Appended to the user's message.
    Static,
    /// Appended to the initial prompt.
    User,
    /// First match in the user's message, the rest in the system prompt.
    Hybrid,
}

/// Per-guild assistant configuration.
///
/// Role overrides map a role id to a value; the highest positioned role of a
/// member that has an override wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub system_prompt: String,
    pub prompt: String,
    pub channel_prompts: HashMap<u64, String>,
    pub channel_id: Option<u64>,
    pub enabled: bool,
    pub mention: bool,
    pub collab_convos: bool,
    /// Conversations are written to disk and restored after a restart.
    pub persistent_conversations: bool,
    pub question_mode: bool,
    pub endswith_questionmark: bool,
    pub min_length: usize,

    pub api_key: Option<String>,
    pub endpoint_override: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timezone: String,

    pub max_tokens: usize,
    pub max_response_tokens: usize,
    pub max_retention: usize,
    pub max_retention_time: u64,

    pub top_n: usize,
    pub min_relatedness: f32,
    pub embed_method: EmbedMethod,

    pub regex_blacklist: Vec<String>,
    pub block_failed_regex: bool,

    /// Channel, category, role or user ids that may not use the assistant.
    pub blacklist: Vec<u64>,
    /// Role or user ids allowed to create and edit memories.
    pub tutors: Vec<u64>,

    pub max_token_role_override: HashMap<u64, usize>,
    pub max_retention_role_override: HashMap<u64, usize>,
    pub max_time_role_override: HashMap<u64, u64>,
    pub model_role_overrides: HashMap<u64, String>,

    pub use_function_calls: bool,
    pub max_function_calls: usize,
    pub disabled_functions: Vec<String>,

    pub usage: HashMap<String, TokenUsage>,
    pub functions_called: u64,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful discord assistant named {botname}".to_string(),
            prompt: "Current time: {timestamp}\nDiscord server you are chatting in: {server}"
                .to_string(),
            channel_prompts: HashMap::new(),
            channel_id: None,
            enabled: true,
            mention: false,
            collab_convos: false,
            persistent_conversations: false,
            question_mode: false,
            endswith_questionmark: false,
            min_length: 7,
            api_key: None,
            endpoint_override: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            timezone: "UTC".to_string(),
            max_tokens: 4000,
            max_response_tokens: 0,
            max_retention: 50,
            max_retention_time: 1800,
            top_n: 3,
            min_relatedness: 0.75,
            embed_method: EmbedMethod::Dynamic,
            regex_blacklist: vec![r"^As an AI language model,".to_string()],
            block_failed_regex: false,
            blacklist: Vec::new(),
            tutors: Vec::new(),
            max_token_role_override: HashMap::new(),
            max_retention_role_override: HashMap::new(),
            max_time_role_override: HashMap::new(),
            model_role_overrides: HashMap::new(),
            use_function_calls: false,
            max_function_calls: 10,
            disabled_functions: Vec::new(),
            usage: HashMap::new(),
            functions_called: 0,
        }
    }
}

fn role_override<T: Clone>(overrides: &HashMap<u64, T>, requester: &Requester) -> Option<T> {
    requester
        .role_ids
        .iter()
        .find_map(|role_id| overrides.get(role_id).cloned())
}

impl GuildSettings {
    pub fn get_user_model(&self, requester: &Requester) -> String {
        role_override(&self.model_role_overrides, requester).unwrap_or_else(|| self.model.clone())
    }

    pub fn get_user_max_tokens(&self, requester: &Requester) -> usize {
        role_override(&self.max_token_role_override, requester).unwrap_or(self.max_tokens)
    }

    pub fn get_user_max_retention(&self, requester: &Requester) -> usize {
        role_override(&self.max_retention_role_override, requester).unwrap_or(self.max_retention)
    }

    pub fn get_user_max_time(&self, requester: &Requester) -> u64 {
        role_override(&self.max_time_role_override, requester).unwrap_or(self.max_retention_time)
    }

    /// Whether this guild can reach any LLM at all.
    pub fn can_call_llm(&self, global_endpoint: bool) -> bool {
        self.api_key.is_some() || self.endpoint_override.is_some() || global_endpoint
    }

    pub fn is_tutor(&self, requester: &Requester) -> bool {
        self.tutors.contains(&requester.user_id)
            || requester.role_ids.iter().any(|r| self.tutors.contains(r))
    }

    /// Returns why the requester may not use the assistant here, if they can't.
    pub fn denial_reason(
        &self,
        requester: &Requester,
        channel_id: u64,
        category_id: Option<u64>,
    ) -> Option<&'static str> {
        if self.blacklist.contains(&requester.user_id) {
            Some("You have been blacklisted from using this command!")
        } else if requester.role_ids.iter().any(|r| self.blacklist.contains(r)) {
            Some("You have a blacklisted role and cannot use this command!")
        } else if self.blacklist.contains(&channel_id) {
            Some("You cannot use that command in this channel!")
        } else if category_id.is_some_and(|c| self.blacklist.contains(&c)) {
            Some("You cannot use that command in any channels under this category")
        } else {
            None
        }
    }

    pub fn update_usage(&mut self, model: &str, usage: TokenUsage) {
        self.usage.entry(model.to_string()).or_default().add(usage);
    }

    /// Toggle an id in a list, returning true if it was added.
    pub fn toggle_id(list: &mut Vec<u64>, id: u64) -> bool {
        if let Some(pos) = list.iter().position(|x| *x == id) {
            list.remove(pos);
            false
        } else {
            list.push(id);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user_id: u64, roles: &[u64]) -> Requester {
        Requester {
            user_id,
            role_ids: roles.to_vec(),
            is_guild_owner: false,
        }
    }

    #[test]
    fn highest_role_override_wins() {
        let mut settings = GuildSettings::default();
        settings.max_token_role_override.insert(10, 8000);
        settings.max_token_role_override.insert(20, 2000);

        // Role 20 sits above role 10 for this member
        assert_eq!(settings.get_user_max_tokens(&member(1, &[20, 10])), 2000);
        assert_eq!(settings.get_user_max_tokens(&member(1, &[10])), 8000);
        assert_eq!(settings.get_user_max_tokens(&member(1, &[99])), 4000);
    }

    #[test]
    fn model_override_falls_back_to_default() {
        let mut settings = GuildSettings::default();
        settings.model_role_overrides.insert(5, "gpt-4o".into());
        assert_eq!(settings.get_user_model(&member(1, &[5])), "gpt-4o");
        assert_eq!(settings.get_user_model(&member(1, &[])), settings.model);
    }

    #[test]
    fn blacklist_checks_user_role_channel_and_category() {
        let mut settings = GuildSettings::default();
        settings.blacklist = vec![1, 2, 3, 4];

        assert!(settings.denial_reason(&member(1, &[]), 9, None).is_some());
        assert!(settings
            .denial_reason(&member(9, &[2]), 9, None)
            .unwrap()
            .contains("role"));
        assert!(settings
            .denial_reason(&member(9, &[]), 3, None)
            .unwrap()
            .contains("channel"));
        assert!(settings
            .denial_reason(&member(9, &[]), 9, Some(4))
            .unwrap()
            .contains("category"));
        assert!(settings.denial_reason(&member(9, &[]), 9, Some(8)).is_none());
    }

    #[test]
    fn tutors_match_user_or_role() {
        let mut settings = GuildSettings::default();
        settings.tutors = vec![42, 7];
        assert!(settings.is_tutor(&member(42, &[])));
        assert!(settings.is_tutor(&member(1, &[7])));
        assert!(!settings.is_tutor(&member(1, &[8])));
    }

    #[test]
    fn usage_accumulates_per_model() {
        let mut settings = GuildSettings::default();
        let usage = TokenUsage {
            total: 10,
            prompt: 7,
            completion: 3,
        };
        settings.update_usage("gpt-4o", usage);
        settings.update_usage("gpt-4o", usage);
        assert_eq!(settings.usage["gpt-4o"].total, 20);
        assert_eq!(settings.usage["gpt-4o"].completion, 6);
    }

    #[test]
    fn settings_deserialize_with_missing_fields() {
        let settings: GuildSettings =
            serde_json::from_str(r#"{"model": "gpt-4o", "embed_method": "hybrid"}"#).unwrap();
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.embed_method, EmbedMethod::Hybrid);
        assert_eq!(settings.max_tokens, 4000);
    }

    #[test]
    fn function_result_role_follows_call_format() {
        let tool = FunctionCall {
            id: Some("call_1".into()),
            name: "f".into(),
            arguments: "{}".into(),
        };
        let legacy = FunctionCall {
            id: None,
            name: "f".into(),
            arguments: "{}".into(),
        };
        assert_eq!(ChatMessage::function_result(&tool, "f", "ok").role, Role::Tool);
        assert_eq!(
            ChatMessage::function_result(&legacy, "f", "ok").role,
            Role::Function
        );
    }
}
