use std::time::Duration;

use regex::Regex;
use tracing::debug;

use guardsymbi_core::config::RecoveryConfig;
use guardsymbi_core::decl::{Backoff, ErrorHandler, RecoveryAction};
use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::types::{FailureKind, StepFailure};

/// Tags step faults with the kind that drives recovery.
///
/// Module faults arrive already typed; `RuntimeError` faults may be
/// reclassified by message rules. Which kinds are worth an AI fix and which
/// are fatal is configuration.
pub struct ErrorChecker {
    rules: Vec<(Regex, FailureKind, Option<String>)>,
    ai_fixable: Vec<FailureKind>,
    fatal: Vec<FailureKind>,
}

impl ErrorChecker {
    pub fn from_config(config: &RecoveryConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.kind, rule.module.clone()))
                    .map_err(|e| {
                        GuardError::Config(format!("Invalid rule pattern '{}': {}", rule.pattern, e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            ai_fixable: config.ai_fixable.clone(),
            fatal: config.fatal.clone(),
        })
    }

    pub fn classify(&self, mut failure: StepFailure) -> StepFailure {
        if failure.kind != FailureKind::RuntimeError {
            return failure;
        }
        let matched = self.rules.iter().find(|(re, _, module)| {
            module.as_deref().map_or(true, |m| m == failure.module) && re.is_match(&failure.message)
        });
        if let Some((re, kind, _)) = matched {
            debug!(pattern = %re, from = %failure.kind, to = %kind, "Reclassified step fault");
            failure.kind = *kind;
        }
        failure
    }

    pub fn is_ai_fixable(&self, kind: FailureKind) -> bool {
        self.ai_fixable.contains(&kind)
    }

    pub fn is_fatal(&self, kind: FailureKind) -> bool {
        self.fatal.contains(&kind)
    }
}

impl Default for ErrorChecker {
    fn default() -> Self {
        let config = RecoveryConfig::default();
        Self {
            rules: Vec::new(),
            ai_fixable: config.ai_fixable,
            fatal: config.fatal,
        }
    }
}

/// What to do after a faulted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Attempt again; consult the AI fixer first when `ai_fix` is set.
    Retry { next_attempt: u32, ai_fix: bool },
    /// Abort the task.
    Exit,
    /// Fail the task but let dependents run degraded.
    Continue,
    /// Fail the task. `exhausted` when a retry was wanted but the bound was hit.
    Fail { exhausted: bool },
    /// Abort the task: the fault kind is configured as fatal.
    Fatal,
}

/// Decide the next move for a faulted attempt.
///
/// Total over (fault kind, attempt, handler). Actions are scanned in order:
/// `ai_fix` arms a fix when the kind is fixable, `retry` fires while
/// `attempt < max_attempts` and is skipped once the bound is reached, and
/// `exit`/`continue` end the scan. An unset bound means `default_max_attempts`.
pub fn decide(
    kind: FailureKind,
    attempt: u32,
    handler: Option<&ErrorHandler>,
    checker: &ErrorChecker,
    default_max_attempts: u32,
) -> RecoveryDecision {
    if checker.is_fatal(kind) {
        return RecoveryDecision::Fatal;
    }
    let Some(handler) = handler else {
        return RecoveryDecision::Fail { exhausted: false };
    };

    let max_attempts = handler.max_attempts.unwrap_or(default_max_attempts).max(1);
    let mut ai_fix = false;
    let mut exhausted = false;

    for action in &handler.actions {
        match action {
            RecoveryAction::AiFix => ai_fix = ai_fix || checker.is_ai_fixable(kind),
            RecoveryAction::Retry if attempt < max_attempts => {
                return RecoveryDecision::Retry {
                    next_attempt: attempt + 1,
                    ai_fix,
                }
            }
            RecoveryAction::Retry => exhausted = true,
            RecoveryAction::Exit => return RecoveryDecision::Exit,
            RecoveryAction::Continue => return RecoveryDecision::Continue,
        }
    }
    RecoveryDecision::Fail { exhausted }
}

/// Delay before attempt `next_attempt`: `initial * multiplier^(n-2)`, capped.
///
/// With jitter the delay is scaled by a random 0.8x to 1.2x.
pub fn calculate_backoff(next_attempt: u32, backoff: &Backoff) -> Duration {
    let exp = next_attempt.saturating_sub(2);
    let factor = (backoff.multiplier.max(1) as u64).saturating_pow(exp);
    let ms = backoff.initial_ms.saturating_mul(factor).min(backoff.max_ms);
    if !backoff.jitter {
        return Duration::from_millis(ms);
    }
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
