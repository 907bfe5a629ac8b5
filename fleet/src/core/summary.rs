//! Structured summaries handed to the notification channel.
//!
//! Contract: a single "all clear" line when there are no exceptions, otherwise
//! a short list grouped by category with at most `max_per_group` entries each.

use std::collections::BTreeMap;

use serde::Serialize;

/// One actionable item (an escalated worktree, a failed rescue, a dead job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryItem {
    pub category: String,
    pub subject: String,
    pub detail: String,
}

impl SummaryItem {
    pub fn new(
        category: impl Into<String>,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            subject: subject.into(),
            detail: detail.into(),
        }
    }
}

/// Counts plus exceptions for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub title: String,
    pub counts: BTreeMap<String, usize>,
    pub exceptions: Vec<SummaryItem>,
}

impl Summary {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn count(&mut self, key: impl Into<String>) {
        *self.counts.entry(key.into()).or_insert(0) += 1;
    }

    pub fn push(&mut self, item: SummaryItem) {
        self.exceptions.push(item);
    }

    pub fn is_all_clear(&self) -> bool {
        self.exceptions.is_empty()
    }

    /// Render the human-facing summary text.
    pub fn render(&self, max_per_group: usize) -> String {
        let counts = self
            .counts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let counts = if counts.is_empty() {
            String::new()
        } else {
            format!(" ({counts})")
        };

        if self.is_all_clear() {
            return format!("{}: all clear{counts}", self.title);
        }

        let mut groups: BTreeMap<&str, Vec<&SummaryItem>> = BTreeMap::new();
        for item in &self.exceptions {
            groups.entry(item.category.as_str()).or_default().push(item);
        }

        let mut out = format!(
            "{}: {} exception(s){counts}",
            self.title,
            self.exceptions.len()
        );
        for (category, items) in groups {
            out.push_str(&format!("\n{category} ({}):", items.len()));
            for item in items.iter().take(max_per_group) {
                out.push_str(&format!("\n  - {}: {}", item.subject, item.detail));
            }
            if items.len() > max_per_group {
                out.push_str(&format!("\n  ... and {} more", items.len() - max_per_group));
            }
        }
        out
    }
}
