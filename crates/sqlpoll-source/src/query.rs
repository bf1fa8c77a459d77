//! Watermark substitution into the configured query template

use crate::watermark::Watermark;

/// Placeholder replaced by the current watermark
pub const PLACEHOLDER: &str = "$@$";

/// Replace every occurrence of [`PLACEHOLDER`] in `template` with `watermark`.
///
/// The value is inserted verbatim; quoting is the template's job
/// (e.g. `WHERE updated_at > '$@$'`).
pub fn build(template: &str, watermark: &str) -> String {
    template.replace(PLACEHOLDER, watermark)
}

/// Builds the statement for each poll from a fixed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    template: String,
}

impl QueryBuilder {
    /// Create a builder for `template`
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// The unmodified template
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the template references the watermark at all
    pub fn has_placeholder(&self) -> bool {
        self.template.contains(PLACEHOLDER)
    }

    /// Statement for the given watermark
    pub fn build(&self, watermark: &Watermark) -> String {
        build(&self.template, watermark.as_str())
    }
}
