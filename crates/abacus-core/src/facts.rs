use regex::Regex;
use serde_json::Value;

use abacus_types::{Fact, FactKind, SandboxResult};

use crate::prompts::FACTS_PREAMBLE;

/// Hard cap on the serialized size of the fact store.
pub const FACTS_MAX_BYTES: usize = 16 * 1024;

const DATASET_EXTENSIONS: &[&str] = &[
    "bam", "sam", "vcf", "csv", "tsv", "parquet", "json", "txt",
];

/// Inserts with per-key dedup: an existing key is overwritten in place so
/// the store never grows on re-observation.
pub fn add_fact(facts: &mut Vec<Fact>, new_fact: Fact) {
    let key = new_fact.dedup_key();
    if let Some(existing) = facts.iter_mut().find(|f| f.dedup_key() == key) {
        *existing = new_fact;
    } else {
        facts.push(new_fact);
    }
}

/// Shrinks the store until its serialized size fits the cap, dropping the
/// oldest evictable fact each pass. Filters go before files; output facts
/// are pinned because they describe artifacts the user asked for.
pub fn evict_facts(facts: &mut Vec<Fact>) {
    while serialized_size(facts) > FACTS_MAX_BYTES {
        let victim = facts
            .iter()
            .enumerate()
            .filter_map(|(idx, fact)| eviction_rank(&fact.kind).map(|rank| (rank, idx)))
            .min();
        let Some((_, idx)) = victim else {
            break;
        };
        facts.remove(idx);
    }
}

fn eviction_rank(kind: &FactKind) -> Option<u8> {
    match kind {
        FactKind::Filter { .. } => Some(0),
        FactKind::File { .. } => Some(1),
        FactKind::Output { .. } => None,
    }
}

fn serialized_size(facts: &[Fact]) -> usize {
    serde_json::to_string(facts).map(|s| s.len()).unwrap_or(0)
}

/// Prompt block for the system message: a data-not-directives preamble and
/// the fact values in a fenced JSON array, bookkeeping stripped. Empty
/// store renders to nothing at all.
pub fn render_facts_block(facts: &[Fact]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let values: Vec<Value> = facts.iter().map(|f| f.render_value()).collect();
    let body = serde_json::to_string_pretty(&values).unwrap_or_else(|_| "[]".to_string());
    format!("{FACTS_PREAMBLE}\n```json\n{body}\n```")
}

/// Best-effort classifier over the executed code and its result. Pure, so a
/// stricter parser can replace it without touching the turn loop. Failed
/// executions never produce facts.
pub fn extract_facts(code: &str, result: &SandboxResult, round: u32) -> Vec<Fact> {
    if !result.is_success() {
        return Vec::new();
    }

    let mut facts = Vec::new();

    if let Ok(re) = Regex::new(r#"read_records\(\s*"([^"]+)""#) {
        for capture in re.captures_iter(code) {
            facts.push(Fact::new(
                round,
                FactKind::File {
                    filename: capture[1].to_string(),
                    summary: "records were read from this file".to_string(),
                },
            ));
        }
    }

    if let Ok(re) = Regex::new(r#"write_file\(\s*"([^"]+)""#) {
        for capture in re.captures_iter(code) {
            facts.push(Fact::new(
                round,
                FactKind::Output {
                    path: capture[1].to_string(),
                    description: "saved by the analysis code".to_string(),
                },
            ));
        }
    }

    if let Ok(re) = Regex::new(r"filter\(([^)]*)\)") {
        if let Some(capture) = re.captures(code) {
            let expression = capture[1].trim().to_string();
            if !expression.is_empty() {
                facts.push(Fact::new(
                    round,
                    FactKind::Filter {
                        expression,
                        matched: None,
                    },
                ));
            }
        }
    }

    if code.contains("list_files(") {
        if let SandboxResult::Success {
            value: Some(Value::Array(items)),
            ..
        } = result
        {
            for item in items {
                let Some(name) = item.as_str() else { continue };
                if has_dataset_extension(name) {
                    facts.push(Fact::new(
                        round,
                        FactKind::File {
                            filename: name.to_string(),
                            summary: "listed in the working directory".to_string(),
                        },
                    ));
                }
            }
        }
    }

    facts
}

fn has_dataset_extension(name: &str) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    DATASET_EXTENSIONS.contains(&ext.as_str())
}
