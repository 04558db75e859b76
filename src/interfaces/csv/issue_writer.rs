use crate::application::validator::IntegrityIssue;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct IssueRow<'a> {
    kind: &'a str,
    category: &'a str,
    severity: &'a str,
    entity_id: &'a str,
    message: &'a str,
    /// Issue-specific fields as a JSON object.
    details: String,
}

/// Writes integrity issues as CSV, one row per issue.
pub struct IssueWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> IssueWriter<W> {
    pub fn new(destination: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(destination),
        }
    }

    /// Writes the header even when `issues` is empty, then flushes.
    pub fn write_issues<'a>(&mut self, issues: impl IntoIterator<Item = &'a IntegrityIssue>) -> Result<()> {
        self.writer
            .write_record(["kind", "category", "severity", "entity_id", "message", "details"])?;
        for issue in issues {
            self.writer.serialize(IssueRow {
                kind: issue.kind.as_str(),
                category: issue.category.as_str(),
                severity: issue.severity.as_str(),
                entity_id: &issue.entity_id,
                message: &issue.message,
                details: serde_json::to_string(&issue.details)?,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
