//! Builtin modules: `JSON`, `File`, `DataValidator`.

pub mod file;
pub mod json;
pub mod validator;

/// Borrow argument `idx` as a string.
pub(crate) fn str_arg<'a>(
    args: &'a [serde_json::Value],
    idx: usize,
    name: &str,
) -> Result<&'a str, guardsymbi_core::StepFailure> {
    args.get(idx).and_then(|v| v.as_str()).ok_or_else(|| {
        guardsymbi_core::StepFailure::validation(format!("argument '{}' must be a string", name))
    })
}
