use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use uuid::Uuid;

use abacus_types::SandboxResult;

/// Everything the orchestrator writes for the user lands under this
/// subdirectory of the sandbox root.
pub const OUTPUT_DIR_NAME: &str = "ai_chat_output";

/// Inline answers larger than this spill to a file.
pub const OVERFLOW_THRESHOLD_BYTES: usize = 64 * 1024;

pub const FEEDBACK_PRINTS_BUDGET: usize = 6 * 1024;
pub const FEEDBACK_TOTAL_BUDGET: usize = 8 * 1024;
pub const FEEDBACK_JSON_OVERHEAD: usize = 256;

pub const NO_OUTPUT_PLACEHOLDER: &str = "(no output produced)";

/// User-visible text of a terminal round: print segments joined by
/// newlines, then the final-expression value when one exists, then a
/// trailing newline. A run that showed nothing (blank prints included)
/// renders the placeholder instead of an empty answer.
pub fn collect_terminal_output(result: &SandboxResult) -> String {
    let SandboxResult::Success {
        value,
        ended_with_expression,
        prints,
        ..
    } = result
    else {
        return NO_OUTPUT_PLACEHOLDER.to_string();
    };

    let mut out = String::new();
    for (i, segment) in prints.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(segment);
    }
    if *ended_with_expression {
        if let Some(value) = value {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&render_value_text(value));
        }
    }
    if out.is_empty() {
        return NO_OUTPUT_PLACEHOLDER.to_string();
    }
    out.push('\n');
    out
}

/// Top-level strings render raw; everything else as compact JSON.
pub fn render_value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Byte-budget cut that never splits a code point: the boundary moves
/// backward while it points at a UTF-8 continuation byte.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let bytes = text.as_bytes();
    let mut cut = max_bytes;
    while cut > 0 && (bytes[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }
    &text[..cut]
}

/// Bounded execution output for round feedback. Prints get their own
/// budget; the expression value gets whatever remains of the total after
/// prints and a fixed JSON-overhead allowance.
pub fn render_feedback_payload(result: &SandboxResult) -> String {
    let SandboxResult::Success {
        value,
        ended_with_expression,
        prints,
        ..
    } = result
    else {
        return String::new();
    };

    let mut printed = String::new();
    for (i, segment) in prints.iter().enumerate() {
        if i > 0 {
            printed.push('\n');
        }
        printed.push_str(segment);
    }

    let mut out = String::new();
    let printed_cut = truncate_utf8(&printed, FEEDBACK_PRINTS_BUDGET);
    if !printed_cut.is_empty() {
        out.push_str(printed_cut);
        if printed_cut.len() < printed.len() {
            out.push_str("\n[printed output truncated]");
        }
    }

    if *ended_with_expression {
        if let Some(value) = value {
            let budget = FEEDBACK_TOTAL_BUDGET
                .saturating_sub(out.len())
                .saturating_sub(FEEDBACK_JSON_OVERHEAD);
            let rendered = render_value_text(value);
            let rendered_cut = truncate_utf8(&rendered, budget);
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(rendered_cut);
            if rendered_cut.len() < rendered.len() {
                out.push_str("\n[value truncated]");
            }
        }
    }

    if out.is_empty() {
        out.push_str(NO_OUTPUT_PLACEHOLDER);
    }
    out
}

/// Resolves (and creates) the per-session output directory. Symlinks in
/// the path are rejected before anything is created, so an escape cannot
/// even plant a directory outside the root; the created directory is then
/// re-resolved through the filesystem and must still live under the
/// sandbox root.
pub async fn resolve_output_dir(allowed_dir: &Path, session_id: &str) -> anyhow::Result<PathBuf> {
    let root = tokio::fs::canonicalize(allowed_dir)
        .await
        .context("resolve sandbox root")?;
    let base = allowed_dir.join(OUTPUT_DIR_NAME);
    reject_symlink(&base).await?;
    let dir = base.join(session_id);
    reject_symlink(&dir).await?;
    tokio::fs::create_dir_all(&dir)
        .await
        .context("create output directory")?;
    let resolved = tokio::fs::canonicalize(&dir)
        .await
        .context("resolve output directory")?;
    if !resolved.starts_with(&root) {
        anyhow::bail!(
            "output directory {} escapes the sandbox root",
            resolved.display()
        );
    }
    Ok(resolved)
}

async fn reject_symlink(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            anyhow::bail!("refusing symlinked output path {}", path.display())
        }
        _ => Ok(()),
    }
}

/// Replaces an oversized answer with a pointer to the file holding the
/// full text. When the file cannot be written safely, the answer is
/// truncated inline instead; nothing is written outside the root.
pub async fn handle_overflow(text: &str, allowed_dir: &Path, session_id: &str) -> String {
    if text.len() <= OVERFLOW_THRESHOLD_BYTES {
        return text.to_string();
    }
    match spill_answer(text, allowed_dir, session_id).await {
        Ok(path) => format!(
            "The full answer is {} bytes, too large to show here. It was saved to `{}`.",
            text.len(),
            path.display()
        ),
        Err(err) => {
            tracing::warn!(error = %err, "could not save oversized answer, truncating inline");
            format!(
                "{}\n[answer truncated from {} bytes; the full text could not be saved]",
                truncate_utf8(text, OVERFLOW_THRESHOLD_BYTES),
                text.len()
            )
        }
    }
}

async fn spill_answer(text: &str, allowed_dir: &Path, session_id: &str) -> anyhow::Result<PathBuf> {
    let dir = resolve_output_dir(allowed_dir, session_id).await?;
    let path = dir.join(format!("answer_{}.txt", Uuid::new_v4()));
    tokio::fs::write(&path, text)
        .await
        .context("write answer file")?;
    Ok(path)
}
