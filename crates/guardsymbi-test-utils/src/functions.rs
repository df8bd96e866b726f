use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use guardsymbi_core::traits::{CallResult, ModuleFunction};
use guardsymbi_core::types::{FailureKind, StepFailure};

/// Fails the first `failures` calls with `kind`, then returns `value`.
///
/// `failures = u32::MAX` never succeeds.
pub struct ScriptedFunction {
    module: String,
    name: String,
    failures: u32,
    kind: FailureKind,
    message: String,
    value: serde_json::Value,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl ScriptedFunction {
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            failures: 0,
            kind: FailureKind::RuntimeError,
            message: "scripted failure".to_string(),
            value: serde_json::Value::Null,
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(mut self, failures: u32, kind: FailureKind) -> Self {
        self.failures = failures;
        self.kind = kind;
        self
    }

    pub fn always_failing(self, kind: FailureKind) -> Self {
        self.failing(u32::MAX, kind)
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn returning(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared call counter, readable after the function moves into a registry.
    pub fn counter(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ModuleFunction for ScriptedFunction {
    fn module(&self) -> &str {
        &self.module
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn call(&self, _args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if n < self.failures {
                Err(StepFailure::new(self.kind, self.message.clone()))
            } else {
                Ok(self.value.clone())
            }
        })
    }
}

/// Returns a fixed value, or echoes its first argument when none is set.
pub struct StaticFunction {
    module: String,
    name: String,
    value: Option<serde_json::Value>,
    collect: bool,
}

impl StaticFunction {
    pub fn new(module: &str, name: &str, value: serde_json::Value) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            value: Some(value),
            collect: false,
        }
    }

    pub fn echo(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            value: None,
            collect: false,
        }
    }

    /// Returns all arguments as an array.
    pub fn collect(module: &str, name: &str) -> Self {
        Self {
            collect: true,
            ..Self::echo(module, name)
        }
    }
}

impl ModuleFunction for StaticFunction {
    fn module(&self) -> &str {
        &self.module
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            if self.collect {
                return Ok(serde_json::Value::Array(args));
            }
            Ok(match &self.value {
                Some(v) => v.clone(),
                None => args.into_iter().next().unwrap_or(serde_json::Value::Null),
            })
        })
    }
}

/// Appends a label to a shared log on every call; used to observe ordering.
pub struct Recorder {
    module: String,
    name: String,
    label: String,
    log: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn new(module: &str, name: &str, label: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            log,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl ModuleFunction for Recorder {
    fn module(&self) -> &str {
        &self.module
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn call(&self, _args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("{}:start", self.label));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().unwrap().push(format!("{}:end", self.label));
            Ok(serde_json::Value::String(self.label.clone()))
        })
    }
}
