use std::io::Write;

use serde_json::json;

use guardsymbi_core::decl::{
    Arg, ElseAction, ErrorHandler, GuardClause, ModuleDecl, OperationRef, RecoveryAction,
    StepDecl, TaskDecl, Version,
};
use guardsymbi_modules::ModuleRegistry;

use crate::functions::StaticFunction;

/// Raw documents fed to the sample workflow's `File.read`.
pub struct SampleInput;

impl SampleInput {
    pub const VALID: &'static str = r#"{"name": "q3", "items": [12, 7.5, 3]}"#;
    /// Trailing comma: `JSON.parse` fails with a ParseError.
    pub const BROKEN: &'static str = r#"{"name": "q3", "items": [12, 7.5, 3],}"#;
    /// Well-formed but `items` holds a string.
    pub const INVALID_SCHEMA: &'static str = r#"{"name": "q3", "items": [12, "seven"]}"#;
}

pub const SAMPLE_ARTIFACT: &str = "reports/q3.pdf";

pub fn sample_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["name", "items"],
        "properties": {
            "name": { "type": "string" },
            "items": { "type": "array", "items": { "type": "number" } }
        }
    })
}

/// `load → validateAndOptimize → report`:
///
/// - `load` reads and parses the input; parse faults get an AI fix, then a retry.
/// - `validateAndOptimize` guards on the schema (suggestFix on failure) and
///   asks the assistant to optimize the value.
/// - `report` renders the optimized data.
pub fn sample_module() -> ModuleDecl {
    let load = TaskDecl::new("load")
        .with_output("data")
        .with_step(
            StepDecl::call(OperationRef::new("File", "read").arg(Arg::value(json!("data/q3.json"))))
                .bind("raw"),
        )
        .with_step(
            StepDecl::call(OperationRef::new("JSON", "parse").arg(Arg::var("raw")))
                .bind("data")
                .on_error(
                    ErrorHandler::new(vec![RecoveryAction::AiFix, RecoveryAction::Retry])
                        .with_max_attempts(3)
                        .with_fix_message("repair the JSON document"),
                ),
        );

    let validate = TaskDecl::new("validateAndOptimize")
        .with_input("load")
        .annotated()
        .with_output("optimized")
        .with_step(StepDecl::guard(
            GuardClause::call(
                OperationRef::new("DataValidator", "validate")
                    .arg(Arg::var("load"))
                    .arg(Arg::value(sample_schema())),
            )
            .bind("valid")
            .otherwise(ElseAction::SuggestFix(
                "input does not match the report schema".to_string(),
            ))
            .otherwise(ElseAction::Return),
        ))
        .with_step(
            StepDecl::call(OperationRef::new("AI", "optimize").arg(Arg::var("valid")))
                .bind("optimized"),
        );

    let report = TaskDecl::new("report")
        .with_input("validateAndOptimize")
        .with_output("artifact")
        .with_step(
            StepDecl::call(
                OperationRef::new("PDF", "render").arg(Arg::var("validateAndOptimize")),
            )
            .bind("artifact"),
        );

    ModuleDecl::new("QuarterlyReport")
        .with_version(Version::new(1, 2, 0))
        .with_import("File")
        .with_import("JSON")
        .with_import("DataValidator")
        .with_import("PDF")
        .with_task(load)
        .with_task(validate)
        .with_task(report)
        .with_run("report")
}

/// Builtins plus a `File.read` that returns `raw` and a stub `PDF.render`.
pub fn sample_registry(raw: &str) -> ModuleRegistry {
    let mut registry = ModuleRegistry::with_builtins();
    registry.unregister("File", "read");
    registry.register(StaticFunction::new("File", "read", json!(raw)));
    registry.register(StaticFunction::new(
        "PDF",
        "render",
        json!({ "artifact": SAMPLE_ARTIFACT }),
    ));
    registry
}

/// Write TOML to a temp file that lives as long as the returned handle.
pub fn write_temp_toml(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f
}
