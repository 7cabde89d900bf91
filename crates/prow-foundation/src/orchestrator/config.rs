//! Deployment configuration and load-time secrets.
//!
//! Everything here is consumed while wiring the orchestrator up, never
//! during request handling.

use std::collections::HashMap;

// ============================================================================
// OrchestratorConfig
// ============================================================================

/// Behavior switches for the front door.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Whether the deployed backend advertises a chat-template interface
    /// (the `"openai-compatible"` deployment tag). Controls both prompt
    /// rendering and the non-streaming response shape.
    pub chat_compatible: bool,
    /// Streaming behavior when the request leaves `stream` unset.
    pub default_stream: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chat_compatible: false,
            default_stream: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat_compatible(mut self, chat_compatible: bool) -> Self {
        self.chat_compatible = chat_compatible;
        self
    }

    pub fn with_default_stream(mut self, default_stream: bool) -> Self {
        self.default_stream = default_stream;
        self
    }
}

// ============================================================================
// SecretStore
// ============================================================================

/// Load-time secret material (registry tokens and the like).
///
/// Populated once during wiring, typically from the environment, and read
/// by whatever loads model or tokenizer artifacts. Request handling never
/// touches it.
#[derive(Default, Clone)]
pub struct SecretStore {
    secrets: HashMap<String, String>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret values.
        f.debug_struct("SecretStore")
            .field("keys", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    /// Populate `name` from the environment variable `var`, when set.
    pub fn load_env(mut self, name: impl Into<String>, var: &str) -> Self {
        if let Ok(value) = std::env::var(var) {
            self.secrets.insert(name.into(), value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }
}
