//! Input and output report schemas.

use crate::field::FieldDef;

/// A typed input report: a schema plus the designated `id_field` naming the source id.
#[derive(Debug, Clone)]
pub struct InputReportDef {
    pub name: String,
    pub id_field: String,
    pub fields: Vec<FieldDef>,
}

impl InputReportDef {
    /// The broker stream this report's raw records are posted to: `<report-name>`.
    pub fn input_stream(&self) -> &str {
        &self.name
    }

    /// The identity sub-stream carrying `(message-id, source_id, seq)`, named
    /// `<report>:_id`.
    pub fn identity_stream(&self) -> String {
        format!("{}:_id", self.name)
    }

    /// The dead-letter stream for malformed records: `<report>:_dlq`.
    pub fn dlq_stream(&self) -> String {
        format!("{}:_dlq", self.name)
    }

    /// The counter key for the per-source sequence number: `counter:<source-id>:<report>`.
    pub fn counter_key(&self, source_id: &str) -> String {
        format!("counter:{source_id}:{}", self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A typed output report referencing existing source or derived fields by name.
#[derive(Debug, Clone)]
pub struct OutputReportDef {
    pub name: String,
    pub required_fields: Vec<String>,
}

impl OutputReportDef {
    /// The broker output stream and pub/sub channel, both named `<output-name>`.
    pub fn output_stream(&self) -> &str {
        &self.name
    }

    pub fn consumer_group(&self) -> String {
        format!("out-{}", self.name)
    }
}
