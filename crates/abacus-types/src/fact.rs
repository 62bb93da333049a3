use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable observation distilled from a successful sandbox run. Facts are
/// injected into the system prompt, so they survive history windowing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub round: u32,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FactKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactKind {
    /// A dataset file the model has looked at.
    File { filename: String, summary: String },
    /// The filter applied during one round. Keyed by round: number of
    /// matched records, when the sandbox reported one.
    Filter {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matched: Option<u64>,
    },
    /// An artifact the model wrote for the user.
    Output { path: String, description: String },
}

/// Identity used for dedup. Every `FactKind` variant must map to exactly one
/// key variant; the match below fails to compile when a kind is added
/// without choosing its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactKey {
    File(String),
    Filter(u32),
    Output(String),
}

impl Fact {
    pub fn new(round: u32, kind: FactKind) -> Self {
        Self {
            round,
            created_at: Utc::now(),
            kind,
        }
    }

    pub fn dedup_key(&self) -> FactKey {
        match &self.kind {
            FactKind::File { filename, .. } => FactKey::File(filename.clone()),
            FactKind::Filter { .. } => FactKey::Filter(self.round),
            FactKind::Output { path, .. } => FactKey::Output(path.clone()),
        }
    }

    /// Content-only value for prompt rendering. Bookkeeping fields (`round`,
    /// `created_at`) stay out of the model's view.
    pub fn render_value(&self) -> Value {
        serde_json::to_value(&self.kind).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_facts_dedup_on_filename() {
        let a = Fact::new(
            1,
            FactKind::File {
                filename: "reads.bam".into(),
                summary: "1.2M alignments".into(),
            },
        );
        let b = Fact::new(
            5,
            FactKind::File {
                filename: "reads.bam".into(),
                summary: "re-read".into(),
            },
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn filter_facts_dedup_on_round() {
        let a = Fact::new(
            2,
            FactKind::Filter {
                expression: "mapq >= 30".into(),
                matched: Some(10),
            },
        );
        let b = Fact::new(
            2,
            FactKind::Filter {
                expression: "flag & 4 == 0".into(),
                matched: None,
            },
        );
        let c = Fact::new(
            3,
            FactKind::Filter {
                expression: "mapq >= 30".into(),
                matched: Some(10),
            },
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn render_value_strips_bookkeeping() {
        let fact = Fact::new(
            4,
            FactKind::Output {
                path: "out/summary.csv".into(),
                description: "per-chromosome coverage".into(),
            },
        );
        let value = fact.render_value();
        assert_eq!(value["type"], "output");
        assert_eq!(value["path"], "out/summary.csv");
        assert!(value.get("round").is_none());
        assert!(value.get("created_at").is_none());
    }
}
