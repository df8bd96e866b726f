//! Declarations — the abstract syntax form of a GuardSymbi program.
//!
//! Parsing the source notation is handled elsewhere; the engine receives
//! these structures (usually deserialized from TOML or JSON) and validates
//! them into a dependency graph.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{GuardError, Result};

/// Reserved module name whose operations are routed to the MCP gateway.
pub const AI_MODULE: &str = "AI";

/// A file holding one or more module declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
}

impl WorkflowFile {
    /// Load declarations from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GuardError::Declaration(e.to_string()))
    }

    /// The first `run` directive found across the modules, if any.
    pub fn run_directive(&self) -> Option<&str> {
        self.modules.iter().find_map(|m| m.run.as_deref())
    }
}

/// A module: a versioned namespace of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
    /// `run <task>` directive.
    #[serde(default)]
    pub run: Option<String>,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Version::default(),
            imports: vec![],
            tasks: vec![],
            run: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_import(mut self, import: impl Into<String>) -> Self {
        self.imports.push(Import::Name(import.into()));
        self
    }

    pub fn with_task(mut self, task: TaskDecl) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_run(mut self, task: impl Into<String>) -> Self {
        self.run = Some(task.into());
        self
    }

    /// Whether `module` is imported (or is the reserved AI module).
    pub fn imports_module(&self, module: &str) -> bool {
        module == AI_MODULE || self.imports.iter().any(|i| i.module() == module)
    }
}

/// An import entry: a bare module name or a package pulled from a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Import {
    Name(String),
    Package {
        module: String,
        #[serde(default)]
        repository: Option<String>,
    },
}

impl Import {
    pub fn module(&self) -> &str {
        match self {
            Import::Name(name) => name,
            Import::Package { module, .. } => module,
        }
    }
}

/// Module version with semver precedence (`1.2.0-beta < 1.2.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }
}

impl FromStr for Version {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('v');
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(GuardError::Declaration(format!("invalid version '{}'", s))),
            None => (s, None),
        };

        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u64> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p.parse::<u64>().map_err(|_| {
                    GuardError::Declaration(format!("invalid {} component in version '{}'", name, s))
                }),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(GuardError::Declaration(format!("invalid version '{}'", s)));
        }

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Capability flags from `@mcp` / `@ai`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub mcp: bool,
    #[serde(default)]
    pub ai: bool,
}

/// A task: a named, ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDecl {
    pub name: String,
    /// Upstream tasks whose outputs this task consumes.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Context binding exported as the task's output.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
}

impl TaskDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: vec![],
            output: None,
            annotations: Annotations::default(),
            steps: vec![],
        }
    }

    pub fn with_input(mut self, task: impl Into<String>) -> Self {
        self.inputs.push(task.into());
        self
    }

    pub fn with_output(mut self, binding: impl Into<String>) -> Self {
        self.output = Some(binding.into());
        self
    }

    /// Mark the task `@mcp`.
    pub fn annotated(mut self) -> Self {
        self.annotations.mcp = true;
        self
    }

    pub fn with_step(mut self, step: StepDecl) -> Self {
        self.steps.push(step);
        self
    }

    /// Whether AI operations are permitted in this task.
    pub fn ai_enabled(&self) -> bool {
        self.annotations.mcp || self.annotations.ai
    }

    /// Name under which dependents see this task's output.
    pub fn output_binding(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }
}

/// One step of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDecl {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call: Option<OperationRef>,
    /// Binding name for the operation's result.
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub guard: Option<GuardClause>,
    #[serde(default)]
    pub on_error: Option<ErrorHandler>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDecl {
    pub fn call(op: OperationRef) -> Self {
        Self {
            call: Some(op),
            ..Self::default()
        }
    }

    pub fn guard(clause: GuardClause) -> Self {
        Self {
            guard: Some(clause),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bind = Some(name.into());
        self
    }

    pub fn with_guard(mut self, clause: GuardClause) -> Self {
        self.guard = Some(clause);
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Label used in events and reports.
    pub fn label(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.call, &self.guard) {
            (Some(op), _) => op.to_string(),
            (None, Some(_)) => format!("guard#{}", index + 1),
            (None, None) => format!("step#{}", index + 1),
        }
    }
}

/// Reference to `module.function(args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRef {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

impl OperationRef {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: vec![],
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn is_ai(&self) -> bool {
        self.module == AI_MODULE
    }

    /// First variable argument, used as the default AI fix target.
    pub fn first_var(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            Arg::Var { var } => Some(var.as_str()),
            Arg::Value { .. } => None,
        })
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

/// An operation argument: a context variable path or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Var { var: String },
    Value { value: serde_json::Value },
}

impl Arg {
    pub fn var(path: impl Into<String>) -> Self {
        Arg::Var { var: path.into() }
    }

    pub fn value(value: serde_json::Value) -> Self {
        Arg::Value { value }
    }
}

/// `guard <condition> else { ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardClause {
    #[serde(flatten)]
    pub condition: GuardCondition,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<ElseAction>,
}

impl GuardClause {
    pub fn call(op: OperationRef) -> Self {
        Self {
            condition: GuardCondition::Call(op),
            bind: None,
            otherwise: vec![],
        }
    }

    pub fn expr(expr: impl Into<String>) -> Self {
        Self {
            condition: GuardCondition::Expr(expr.into()),
            bind: None,
            otherwise: vec![],
        }
    }

    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.bind = Some(name.into());
        self
    }

    pub fn otherwise(mut self, action: ElseAction) -> Self {
        self.otherwise.push(action);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardCondition {
    /// `guard let x = Module.fn(args)`.
    Call(OperationRef),
    /// A comparison or truthiness expression.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElseAction {
    SuggestFix(String),
    ExplainError(String),
    Log(String),
    Return,
}

/// `onError { ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default)]
    pub actions: Vec<RecoveryAction>,
    /// Total attempts including the first one.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    #[serde(default)]
    pub fix_message: Option<String>,
    /// Context binding replaced by the AI fix value.
    #[serde(default)]
    pub fix_target: Option<String>,
    #[serde(default)]
    pub ai_timeout_secs: Option<u64>,
}

impl ErrorHandler {
    pub fn new(actions: Vec<RecoveryAction>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_fix_message(mut self, message: impl Into<String>) -> Self {
        self.fix_message = Some(message.into());
        self
    }

    pub fn with_fix_target(mut self, binding: impl Into<String>) -> Self {
        self.fix_target = Some(binding.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Exit,
    AiFix,
    Continue,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Exit => "exit",
            RecoveryAction::AiFix => "ai_fix",
            RecoveryAction::Continue => "continue",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    5_000
}

fn default_multiplier() -> u32 {
    2
}
