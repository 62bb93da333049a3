use abacus_types::HistoryEntry;

/// Fixed divisor approximation of tokens per UTF-8 byte. Deliberately not a
/// tokenizer; the window fraction below absorbs the estimation error.
pub const BYTES_PER_TOKEN: usize = 4;

/// Share of the context window the history may fill. The rest is headroom
/// for the system prompt, facts block, and the response.
pub const CONTEXT_BUDGET_FRACTION: f64 = 0.75;

pub fn estimate_tokens(text: &str) -> u64 {
    text.len().div_ceil(BYTES_PER_TOKEN) as u64
}

/// Bounded prompt history: failed-round pruning followed by a backward
/// token-budget walk. Pure; the caller owns the real history.
pub fn transform_history(history: &[HistoryEntry], budget_tokens: u32) -> Vec<HistoryEntry> {
    let pruned = prune_failed_rounds(history);
    window_history(&pruned, budget_tokens)
}

/// Drops every consecutive (assistant, error-feedback) pair except the most
/// recent one, so the model still sees its latest mistake without earlier
/// failures crowding the window.
pub fn prune_failed_rounds(history: &[HistoryEntry]) -> Vec<HistoryEntry> {
    let mut pair_starts = Vec::new();
    let mut i = 0;
    while i + 1 < history.len() {
        if history[i].is_assistant() && history[i + 1].is_error_feedback() {
            pair_starts.push(i);
            i += 2;
        } else {
            i += 1;
        }
    }

    let Some((_, doomed)) = pair_starts.split_last() else {
        return history.to_vec();
    };

    let mut skip = vec![false; history.len()];
    for &start in doomed {
        skip[start] = true;
        skip[start + 1] = true;
    }
    history
        .iter()
        .enumerate()
        .filter(|(idx, _)| !skip[*idx])
        .map(|(_, entry)| entry.clone())
        .collect()
}

/// Keeps the newest entry unconditionally, then walks backward adding
/// entries while the running token estimate stays inside the budget. The
/// first entry that would overflow ends the walk; everything older goes.
pub fn window_history(history: &[HistoryEntry], budget_tokens: u32) -> Vec<HistoryEntry> {
    let Some((newest, older)) = history.split_last() else {
        return Vec::new();
    };

    let effective_budget = (budget_tokens as f64 * CONTEXT_BUDGET_FRACTION) as u64;
    let mut kept = vec![newest.clone()];
    let mut used = estimate_tokens(newest.content());

    for entry in older.iter().rev() {
        let cost = estimate_tokens(entry.content());
        if used + cost > effective_budget {
            break;
        }
        kept.push(entry.clone());
        used += cost;
    }

    kept.reverse();
    kept
}
