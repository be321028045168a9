//! Colored output helpers for the operator CLI

use crate::confidence::ConfidenceLevel;
use crate::escalation::{EscalationItem, EscalationStatus, QueueStats};
use owo_colors::OwoColorize;

const COLUMN_WIDTH: usize = 15;
const ID_WIDTH: usize = 36;

/// Output style configuration
pub struct Output {
    /// Whether to use colored output
    pub colored: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Output {
    pub fn new() -> Self {
        Self { colored: true }
    }

    pub fn no_color() -> Self {
        Self { colored: false }
    }

    pub fn banner(&self) {
        let version = format!("v{}", env!("CARGO_PKG_VERSION"));
        if self.colored {
            println!(
                "\n   {} {}\n   {}\n",
                "triangulate".bright_cyan().bold(),
                version.dimmed(),
                "vision · retrieval · web · generation".blue()
            );
        } else {
            println!(
                "\n   triangulate {}\n   vision, retrieval, web, generation\n",
                version
            );
        }
    }

    pub fn success(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "✓".green().bold(), message.green());
        } else {
            println!("  [OK] {}", message);
        }
    }

    pub fn info(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "•".blue(), message);
        } else {
            println!("  [INFO] {}", message);
        }
    }

    pub fn warning(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "⚠".yellow().bold(), message.yellow());
        } else {
            println!("  [WARN] {}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.colored {
            eprintln!("  {} {}", "✗".red().bold(), message.red());
        } else {
            eprintln!("  [ERROR] {}", message);
        }
    }

    pub fn header(&self, title: &str) {
        if self.colored {
            println!("\n  {}", title.bright_white().bold().underline());
        } else {
            println!("\n  === {} ===", title);
        }
    }

    pub fn kv(&self, key: &str, value: &str) {
        if self.colored {
            println!("    {}: {}", key.dimmed(), value.bright_white());
        } else {
            println!("    {}: {}", key, value);
        }
    }

    pub fn list_item(&self, item: &str) {
        if self.colored {
            println!("    {} {}", "•".blue(), item);
        } else {
            println!("    - {}", item);
        }
    }

    pub fn hint(&self, message: &str) {
        if self.colored {
            println!("\n  {}", message.dimmed().italic());
        } else {
            println!("\n  [TIP] {}", message);
        }
    }

    /// Status label, colored by how far along review is.
    pub fn status_label(&self, status: EscalationStatus) -> String {
        let label = format!("{:<width$}", status.as_str(), width = COLUMN_WIDTH);
        if !self.colored {
            return label;
        }
        match status {
            EscalationStatus::Pending => label.yellow().to_string(),
            EscalationStatus::InReview => label.cyan().to_string(),
            EscalationStatus::Resolved => label.green().to_string(),
        }
    }

    pub fn confidence_label(&self, level: ConfidenceLevel, overall: f64) -> String {
        let label = format!("{} ({:.3})", level, overall);
        if !self.colored {
            return label;
        }
        match level {
            ConfidenceLevel::High => label.green().to_string(),
            ConfidenceLevel::Medium => label.yellow().to_string(),
            ConfidenceLevel::Low => label.red().to_string(),
        }
    }

    pub fn escalation_header(&self) {
        let header = format!(
            "{:<ID_WIDTH$} {}",
            "ID",
            pad_columns(&["Status", "Confidence", "Created"])
        );
        let rule_len = ID_WIDTH + 1 + 3 * (COLUMN_WIDTH + 1);
        if self.colored {
            println!("    {}", header.bright_white().bold());
            println!("    {}", "─".repeat(rule_len).dimmed());
        } else {
            println!("    {}", header);
            println!("    {}", "-".repeat(rule_len));
        }
    }

    /// One line per escalation in `escalations list`.
    pub fn escalation_row(&self, item: &EscalationItem) {
        let created = item.created_at.format("%Y-%m-%d %H:%M").to_string();
        let overall = format!("{:.3}", item.confidence_profile.overall);
        println!(
            "    {:<ID_WIDTH$} {} {:<COLUMN_WIDTH$} {}",
            item.id.to_string(),
            self.status_label(item.status),
            overall,
            created
        );
    }

    /// Full view of one escalation for `escalations show`.
    pub fn escalation_detail(&self, item: &EscalationItem) {
        self.header(&format!("Escalation {}", item.id));
        self.kv("request", &item.request_id.to_string());
        self.kv("status", item.status.as_str());
        self.kv("created", &item.created_at.to_rfc3339());
        self.kv("updated", &item.updated_at.to_rfc3339());
        if let Some(resolved_at) = item.resolved_at {
            self.kv("resolved", &resolved_at.to_rfc3339());
        }
        self.kv(
            "confidence",
            &self.confidence_label(
                item.confidence_profile.level,
                item.confidence_profile.overall,
            ),
        );
        if let Some(text) = item.query_snapshot.text() {
            self.kv("query", text);
        }
        if item.query_snapshot.has_image() {
            self.kv("image", "attached");
        }
        if let Some(note) = &item.reviewer_note {
            self.kv("reviewer note", note);
        }

        if !item.reasons.is_empty() {
            self.header("Reasons");
            for reason in &item.reasons {
                self.list_item(&reason.to_string());
            }
        }
        if !item.contradictions.is_empty() {
            self.header("Contradictions");
            for contradiction in &item.contradictions {
                self.list_item(&contradiction.description);
            }
        }
        if let Some(draft) = &item.draft_answer {
            self.header("Draft answer");
            println!("    {}", draft);
        }
    }

    pub fn queue_stats(&self, stats: &QueueStats) {
        self.header("Escalation queue");
        self.kv("total", &stats.total.to_string());
        self.kv("pending", &stats.pending.to_string());
        self.kv("in review", &stats.in_review.to_string());
        self.kv("resolved", &stats.resolved.to_string());
    }

    pub fn newline(&self) {
        println!();
    }
}

fn pad_columns(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("{:<width$}", v, width = COLUMN_WIDTH))
        .collect::<Vec<_>>()
        .join(" ")
}
