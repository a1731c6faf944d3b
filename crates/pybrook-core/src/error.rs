//! Compile-time errors. These fail model compilation fast, before any worker starts.

use thiserror::Error;

/// Errors detected while compiling a declarative model into a consumer graph.
///
/// Mirrors the teacher's `RdeError` shape: one variant per distinguishable failure mode,
/// each carrying enough context to print a useful message without a backtrace.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("artificial field '{field}' declares unknown dependency '{dependency}'")]
    UnknownFieldReference { field: String, dependency: String },

    #[error("output report '{report}' references unknown field '{field}'")]
    UnknownOutputField { report: String, field: String },

    #[error("historical dependency on unknown field '{field}' (declared by '{consumer}')")]
    HistoryOnUnknownField { consumer: String, field: String },

    #[error("dependency cycle among current dependencies: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("duplicate report name '{0}'")]
    DuplicateReportName(String),

    #[error("duplicate field name '{0}'")]
    DuplicateFieldName(String),

    #[error("input report '{0}' has no id_field declared")]
    MissingIdField(String),

    #[error("input report '{report}' declares id_field '{id_field}' which is not one of its fields")]
    UnknownIdField { report: String, id_field: String },
}
