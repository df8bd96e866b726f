use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::decl::{Backoff, ErrorHandler};
use crate::error::{GuardError, Result};
use crate::types::{FailureKind, McpRequestKind};

/// Top-level GuardSymbi configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutionConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum number of tasks running at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Default timeout for a single step operation call.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Optional deadline for a whole run.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// Reject `AI.*` step operations in tasks without `@mcp`/`@ai`.
    #[serde(default = "default_require_ai_annotation")]
    pub require_ai_annotation: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            step_timeout_secs: default_step_timeout(),
            run_timeout_secs: None,
            require_ai_annotation: default_require_ai_annotation(),
        }
    }
}

fn default_max_parallel() -> usize {
    8
}

fn default_step_timeout() -> u64 {
    30
}

fn default_require_ai_annotation() -> bool {
    true
}

/// Failure classification and default recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Attempt bound used when a handler does not set `max_attempts`.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Kinds for which invoking AI fix is meaningful.
    #[serde(default = "default_ai_fixable")]
    pub ai_fixable: Vec<FailureKind>,
    /// Kinds that abort the task regardless of its handler.
    #[serde(default)]
    pub fatal: Vec<FailureKind>,
    /// Handlers applied when a step declares no onError block.
    #[serde(default)]
    pub defaults: Vec<DefaultHandler>,
    /// Message-based reclassification of runtime errors.
    #[serde(default)]
    pub rules: Vec<ClassificationRule>,
    /// Delay between attempts for handlers that set no backoff of their own.
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            ai_fixable: default_ai_fixable(),
            fatal: vec![],
            defaults: vec![],
            rules: vec![],
            backoff: None,
        }
    }
}

impl RecoveryConfig {
    /// Default handler configured for `kind`, if any.
    pub fn handler_for(&self, kind: FailureKind) -> Option<&ErrorHandler> {
        self.defaults
            .iter()
            .find(|d| d.kind == kind)
            .map(|d| &d.handler)
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_ai_fixable() -> Vec<FailureKind> {
    vec![FailureKind::ParseError, FailureKind::ValidationError]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultHandler {
    pub kind: FailureKind,
    #[serde(flatten)]
    pub handler: ErrorHandler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Regex matched against the failure message.
    pub pattern: String,
    pub kind: FailureKind,
    /// Restrict the rule to one module.
    #[serde(default)]
    pub module: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    pub transport: McpTransport,
    /// Per-request timeout in seconds. Default: 30.
    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tools: McpToolNames,
}

fn default_mcp_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    /// MCP server spawned as a child process.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// MCP server over streamable HTTP.
    StreamableHttp { url: String },
    /// Direct JSON request/response endpoint.
    Https {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl McpTransport {
    fn url(&self) -> Option<&str> {
        match self {
            McpTransport::Stdio { .. } => None,
            McpTransport::StreamableHttp { url } | McpTransport::Https { url, .. } => Some(url),
        }
    }
}

/// MCP tool names invoked for each request kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolNames {
    #[serde(default = "default_fix_tool")]
    pub fix: String,
    #[serde(default = "default_suggest_fix_tool")]
    pub suggest_fix: String,
    #[serde(default = "default_optimize_tool")]
    pub optimize: String,
    #[serde(default = "default_explain_error_tool")]
    pub explain_error: String,
}

impl McpToolNames {
    pub fn tool_for(&self, kind: McpRequestKind) -> &str {
        match kind {
            McpRequestKind::Fix => &self.fix,
            McpRequestKind::SuggestFix => &self.suggest_fix,
            McpRequestKind::Optimize => &self.optimize,
            McpRequestKind::ExplainError => &self.explain_error,
        }
    }
}

impl Default for McpToolNames {
    fn default() -> Self {
        Self {
            fix: default_fix_tool(),
            suggest_fix: default_suggest_fix_tool(),
            optimize: default_optimize_tool(),
            explain_error: default_explain_error_tool(),
        }
    }
}

fn default_fix_tool() -> String {
    "fix".to_string()
}

fn default_suggest_fix_tool() -> String {
    "suggest_fix".to_string()
}

fn default_optimize_tool() -> String {
    "optimize".to_string()
}

fn default_explain_error_tool() -> String {
    "explain_error".to_string()
}

/// JSONL execution log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run and task events, 2 = + steps and guards, 3 = + AI calls.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GuardError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: EngineConfig =
            toml::from_str(&expanded).map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_parallel == 0 {
            return Err(GuardError::Config(
                "engine.max_parallel must be at least 1".into(),
            ));
        }
        if self.recovery.default_max_attempts == 0 {
            return Err(GuardError::Config(
                "recovery.default_max_attempts must be at least 1".into(),
            ));
        }
        for rule in &self.recovery.rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                GuardError::Config(format!("invalid classification pattern '{}': {}", rule.pattern, e))
            })?;
        }
        if let Some(url) = self.mcp.as_ref().and_then(|m| m.transport.url()) {
            if !url.starts_with("https://") && !is_loopback_url(url) {
                return Err(GuardError::Config(format!(
                    "MCP endpoint '{}' must use https:// when not on loopback",
                    url
                )));
            }
        }
        Ok(())
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("http://") else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
