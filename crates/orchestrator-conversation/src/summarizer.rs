//! Summarizers that fold old messages into one synthetic summary.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use orchestrator_models::{Message, MessageId, MessageKind};

use crate::error::Result;

/// Approximate characters per token for estimation.
pub const CHARS_PER_TOKEN: usize = 4;

/// First line of every summary body.
pub const SUMMARY_HEADER: &str = "[CONVERSATION SUMMARY]";

const OPEN_TASKS: &str = "Open tasks:";
const COMPLETED_TASKS: &str = "Completed tasks:";
const OPEN_ESCALATIONS: &str = "Open escalations:";
const RESOLVED_ESCALATIONS: &str = "Resolved escalations:";

/// Maximum characters of a message body quoted in a summary line.
const EXCERPT_CHARS: usize = 160;

/// Turns a run of messages into summary text.
///
/// `open` holds the ids of assignments and escalations in `messages`, or
/// folded into a summary at its head, that have not been answered yet. The
/// store refuses a summary that does not mention every raw one by id.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message], open: &HashSet<MessageId>) -> Result<String>;

    /// Estimate the number of tokens in a text.
    fn estimate_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Deterministic summarizer that keeps counts plus one line per tracked message.
///
/// Open items from an earlier summary at the head of `messages` are carried
/// forward and move to the resolved lists once they leave `open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

#[derive(Default)]
struct Sections {
    open_tasks: Vec<String>,
    completed_tasks: Vec<String>,
    open_escalations: Vec<String>,
    resolved_escalations: Vec<String>,
}

impl ExtractiveSummarizer {
    fn line(message: &Message) -> String {
        let mut excerpt: String = message.body.chars().take(EXCERPT_CHARS).collect();
        if excerpt.len() < message.body.len() {
            excerpt.push_str("...");
        }
        format!("- [{}] from {}: {}", message.id, message.from, excerpt.replace('\n', " "))
    }

    /// Returns the bracketed id at the start of a summary line.
    fn line_id(line: &str) -> Option<&str> {
        line.strip_prefix("- [")?.split(']').next()
    }

    /// Extracts the compacted count and open lines from a previous summary.
    fn carried(previous: &Message) -> (usize, Vec<String>, Vec<String>) {
        let mut count = 0;
        let mut tasks = Vec::new();
        let mut escalations = Vec::new();
        let mut section = "";

        for line in previous.body.lines() {
            if let Some(rest) = line.strip_prefix("Compacted ") {
                count = rest
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
            } else if line.ends_with(':') && !line.starts_with("- ") {
                section = line;
            } else if line.starts_with("- [") {
                match section {
                    OPEN_TASKS => tasks.push(line.to_string()),
                    OPEN_ESCALATIONS => escalations.push(line.to_string()),
                    _ => {}
                }
            }
        }
        (count, tasks, escalations)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message], open: &HashSet<MessageId>) -> Result<String> {
        let (previous, raw) = match messages.first() {
            Some(first) if first.synthetic => (Some(first), &messages[1..]),
            _ => (None, messages),
        };

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut sections = Sections::default();
        let still_open = |line: &str| Self::line_id(line).is_some_and(|id| open.contains(&MessageId::from(id)));

        let mut earlier = 0;
        if let Some(previous) = previous {
            let (count, tasks, escalations) = Self::carried(previous);
            earlier = count;
            for line in tasks {
                if still_open(&line) {
                    sections.open_tasks.push(line);
                } else {
                    sections.completed_tasks.push(line);
                }
            }
            for line in escalations {
                if still_open(&line) {
                    sections.open_escalations.push(line);
                } else {
                    sections.resolved_escalations.push(line);
                }
            }
        }

        for message in raw {
            *counts.entry(message.kind.as_str()).or_default() += 1;
            if !message.is_tracked() {
                continue;
            }
            let is_open = open.contains(&message.id);
            let line = Self::line(message);
            match (message.kind, is_open) {
                (MessageKind::TaskAssignment, true) => sections.open_tasks.push(line),
                (MessageKind::TaskAssignment, false) => sections.completed_tasks.push(line),
                (_, true) => sections.open_escalations.push(line),
                (_, false) => sections.resolved_escalations.push(line),
            }
        }

        let breakdown = counts
            .iter()
            .map(|(kind, n)| format!("{} {}", n, kind))
            .collect::<Vec<_>>()
            .join(", ");
        let total = earlier + raw.len();

        let mut out = vec![SUMMARY_HEADER.to_string()];
        out.push(match (previous.is_some(), breakdown.is_empty()) {
            (_, true) => format!("Compacted {} messages", total),
            (false, false) => format!("Compacted {} messages: {}", total, breakdown),
            (true, false) => format!(
                "Compacted {} messages ({} earlier, this round: {})",
                total, earlier, breakdown
            ),
        });
        for (title, lines) in [
            (OPEN_TASKS, &sections.open_tasks),
            (COMPLETED_TASKS, &sections.completed_tasks),
            (OPEN_ESCALATIONS, &sections.open_escalations),
            (RESOLVED_ESCALATIONS, &sections.resolved_escalations),
        ] {
            if !lines.is_empty() {
                out.push(title.to_string());
                out.extend(lines.iter().cloned());
            }
        }
        Ok(out.join("\n"))
    }
}
