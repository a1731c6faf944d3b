//! Declared consumption of one field by an artificial-field function.

/// A single dependency declaration for an artificial field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Value for the same message-id.
    Current { field: String },
    /// An ordered window of the most recent `window` prior values for the same
    /// source, not including the current message. Missing slots are `null`.
    Historical { field: String, window: usize },
}

impl Dependency {
    pub fn current(field: impl Into<String>) -> Self {
        Dependency::Current {
            field: field.into(),
        }
    }

    pub fn historical(field: impl Into<String>, window: usize) -> Self {
        Dependency::Historical {
            field: field.into(),
            window,
        }
    }

    pub fn field_name(&self) -> &str {
        match self {
            Dependency::Current { field } => field,
            Dependency::Historical { field, .. } => field,
        }
    }

    pub fn is_historical(&self) -> bool {
        matches!(self, Dependency::Historical { .. })
    }
}
