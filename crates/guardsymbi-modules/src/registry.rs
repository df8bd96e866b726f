use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use guardsymbi_core::traits::{CallResult, ModuleFunction};
use guardsymbi_core::types::{FailureKind, StepFailure};

/// Registry of callable module functions, keyed by (module, function).
pub struct ModuleRegistry {
    functions: HashMap<(String, String), Arc<dyn ModuleFunction>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Register a function.
    pub fn register(&mut self, function: impl ModuleFunction) {
        self.register_arc(Arc::new(function));
    }

    pub fn register_arc(&mut self, function: Arc<dyn ModuleFunction>) {
        let key = (function.module().to_string(), function.name().to_string());
        debug!(module = %key.0, function = %key.1, "Registered module function");
        self.functions.insert(key, function);
    }

    /// Unregister a function.
    pub fn unregister(&mut self, module: &str, function: &str) -> bool {
        self.functions
            .remove(&(module.to_string(), function.to_string()))
            .is_some()
    }

    /// Look up a function.
    pub fn get(&self, module: &str, function: &str) -> Option<Arc<dyn ModuleFunction>> {
        self.functions
            .get(&(module.to_string(), function.to_string()))
            .cloned()
    }

    pub fn contains(&self, module: &str, function: &str) -> bool {
        self.get(module, function).is_some()
    }

    /// All registered functions as `Module.function`, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .map(|(m, f)| format!("{}.{}", m, f))
            .collect();
        names.sort();
        names
    }

    /// Call a function with a deadline.
    ///
    /// Lookup misses, arity mismatches, and timeouts come back as
    /// `StepFailure`s attributed to `module.function`.
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<serde_json::Value>,
        default_timeout: Duration,
    ) -> CallResult {
        let f = self.get(module, function).ok_or_else(|| {
            StepFailure::new(
                FailureKind::UnknownOperation,
                format!("no function {}.{} is registered", module, function),
            )
            .at(module, function)
        })?;

        if let Some(arity) = f.arity() {
            if args.len() != arity {
                return Err(StepFailure::runtime(format!(
                    "expected {} argument(s), got {}",
                    arity,
                    args.len()
                ))
                .at(module, function));
            }
        }

        let timeout = f
            .timeout_secs()
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        match tokio::time::timeout(timeout, f.call(args)).await {
            Ok(result) => result.map_err(|e| e.at(module, function)),
            Err(_) => Err(StepFailure::new(
                FailureKind::TimeoutError,
                format!("call exceeded {}ms", timeout.as_millis()),
            )
            .at(module, function)),
        }
    }

    /// Create a registry with the builtin modules registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── JSON ────────────────────────────────────────────────
        registry.register(crate::builtin::json::JsonParse);
        registry.register(crate::builtin::json::JsonStringify);
        registry.register(crate::builtin::json::JsonGet);

        // ── File ────────────────────────────────────────────────
        registry.register(crate::builtin::file::FileRead);
        registry.register(crate::builtin::file::FileWrite);

        // ── DataValidator ───────────────────────────────────────
        registry.register(crate::builtin::validator::Validate);
        registry.register(crate::builtin::validator::NonEmpty);

        registry
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter turning an async closure into a `ModuleFunction`.
pub struct FnFunction<F> {
    module: String,
    name: String,
    arity: Option<usize>,
    f: F,
}

impl<F, Fut> FnFunction<F>
where
    F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    pub fn new(module: impl Into<String>, name: impl Into<String>, f: F) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            arity: None,
            f,
        }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }
}

impl<F, Fut> ModuleFunction for FnFunction<F>
where
    F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    fn module(&self) -> &str {
        &self.module
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }

    fn call(&self, args: Vec<serde_json::Value>) -> BoxFuture<'_, CallResult> {
        Box::pin((self.f)(args))
    }
}
