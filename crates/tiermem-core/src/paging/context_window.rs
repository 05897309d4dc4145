//! Keeping the working layer within the LLM context budget.
//!
//! Sizes here are payload bytes (`data_size`) of working-layer keys, not
//! arena bytes; framing does not reach the model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::directory::{ContextKey, Layer, MAX_IMPORTANCE};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::TaggedMemory;
use crate::state::AgentState;

/// Keys touched within this window count as recent.
pub const RECENT_SECS: i64 = 3600;
const BOOST_BELOW: u8 = 70;
const BOOST: u8 = 20;
const OVERFLOW_DEMOTE_MAX_IMPORTANCE: u8 = 60;
const OVERFLOW_DEMOTE_BATCH: usize = 20;
const OVERFLOW_EXPIRY_SECS: i64 = 7 * 86_400;

/// Snapshot of working-layer usage against the window size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextWindowInfo {
    pub current_size: usize,
    pub max_size: usize,
    pub key_count: usize,
    pub estimated_tokens: usize,
    pub utilization_percent: f64,
}

/// Rough token count at four characters per token.
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

/// State-aware priority used to order keys for the context window.
///
/// Same weights as query relevance (importance 4, recency 3, layer 2,
/// size 1, all tenths) but recency buckets are finer and the layer
/// preference depends on `state`.
pub fn context_priority(key: &ContextKey, state: AgentState, now: DateTime<Utc>) -> u32 {
    let recency = match key.age_secs(now) {
        a if a < 300 => 30,
        a if a < 3_600 => 25,
        a if a < 86_400 => 20,
        a if a < 604_800 => 15,
        _ => 10,
    };
    let layer = match (state, key.layer) {
        (AgentState::Thinking, Layer::Working) => 20,
        (AgentState::Thinking, Layer::Disk) => 15,
        (AgentState::Thinking, Layer::Archived) => 10,
        (AgentState::Executing, Layer::Working) => 25,
        (AgentState::Executing, Layer::Disk) => 10,
        (AgentState::Executing, Layer::Archived) => 5,
        (AgentState::Evaluating, Layer::Archived) => 15,
        (AgentState::Evaluating, _) => 20,
        (AgentState::Paging, _) => 15,
    };
    let size = match key.data_size {
        s if s < 512 => 10,
        s if s < 2_048 => 8,
        s if s < 8_192 => 6,
        _ => 4,
    };
    u32::from(key.importance) * 4 + recency * 3 + layer * 2 + size
}

/// Character budget for a prepared context, as a percentage of the
/// token allowance.
fn budget_percent(state: AgentState) -> usize {
    match state {
        AgentState::Thinking => 90,
        AgentState::Executing => 80,
        AgentState::Evaluating => 95,
        AgentState::Paging => 100,
    }
}

impl TaggedMemory {
    fn working_size(&self) -> usize {
        self.keys()
            .iter()
            .filter(|k| k.layer == Layer::Working)
            .map(|k| k.data_size)
            .sum()
    }

    /// Move keys one at a time until the working size drops to `target`.
    /// Returns how many were moved.
    fn demote_until(&mut self, candidates: Vec<ContextKey>, target: usize) -> usize {
        let mut size = self.working_size();
        let mut moved = 0;
        for key in candidates {
            if size <= target {
                break;
            }
            match self.relocate(&key.name, Layer::Disk) {
                Ok(()) => {
                    size = size.saturating_sub(key.data_size);
                    moved += 1;
                }
                Err(e) => warn!(key = %key.name, error = %e, "demotion skipped key"),
            }
        }
        moved
    }

    pub fn context_window_calculate(&self) -> ContextWindowInfo {
        let current_size = self.working_size();
        let max_size = self.config().context_window_max_size;
        ContextWindowInfo {
            current_size,
            max_size,
            key_count: self
                .keys()
                .iter()
                .filter(|k| k.layer == Layer::Working)
                .count(),
            estimated_tokens: estimate_tokens(current_size),
            utilization_percent: current_size as f64 * 100.0 / max_size.max(1) as f64,
        }
    }

    /// Bring the working layer under `max_size` bytes by demoting keys to
    /// disk, lowest importance and oldest first. Once over budget it aims
    /// for 90% of `max_size` to avoid thrashing.
    ///
    /// Keys at or above the expiry exemption importance stay put, as do
    /// keys touched in the last hour when `preserve_recent` is set. Never
    /// deletes. Returns the number of keys moved.
    pub fn context_window_trim(&mut self, max_size: usize, preserve_recent: bool) -> MemoryResult<usize> {
        if max_size == 0 {
            return Err(MemoryError::invalid("context window max_size must be positive"));
        }
        if self.working_size() <= max_size {
            return Ok(0);
        }
        let now = self.now();
        let exempt = self.config().expiry_exemption_importance;
        let mut candidates: Vec<ContextKey> = self
            .keys()
            .iter()
            .filter(|k| k.layer == Layer::Working && k.importance < exempt)
            .filter(|k| !preserve_recent || k.age_secs(now) >= RECENT_SECS)
            .cloned()
            .collect();
        candidates.sort_by_key(|k| (k.importance, k.last_accessed));
        let moved = self.demote_until(candidates, max_size * 9 / 10);
        info!(event = "context_window_trimmed", moved, max_size, preserve_recent);
        Ok(moved)
    }

    /// Keep the `max_keys` best keys (importance, then recency) in the
    /// working layer and move the other non-archived keys to disk.
    /// Returns the number of keys moved.
    pub fn context_window_prioritize(&mut self, max_keys: usize) -> MemoryResult<usize> {
        let mut ranked: Vec<ContextKey> = self
            .keys()
            .iter()
            .filter(|k| k.layer != Layer::Archived)
            .cloned()
            .collect();
        ranked.sort_by_key(|k| (Reverse(k.importance), Reverse(k.last_accessed)));

        let mut moved = 0;
        for (rank, key) in ranked.iter().enumerate() {
            let target = if rank < max_keys {
                Layer::Working
            } else {
                Layer::Disk
            };
            if key.layer == target {
                continue;
            }
            match self.relocate(&key.name, target) {
                Ok(()) => moved += 1,
                Err(e) => warn!(key = %key.name, error = %e, "prioritize skipped key"),
            }
        }
        info!(event = "context_window_prioritized", moved, max_keys);
        Ok(moved)
    }

    /// Render the highest-priority keys for `state` as prompt context
    /// within roughly `max_tokens`.
    pub fn context_window_prepare_llm(&self, state: AgentState, max_tokens: usize) -> MemoryResult<String> {
        if max_tokens == 0 {
            return Err(MemoryError::invalid("max_tokens must be positive"));
        }
        let now = self.now();
        let budget = max_tokens * 4 * budget_percent(state) / 100;
        let mut out = String::new();
        let _ = write!(
            out,
            "=== AGENT CONTEXT ===\nState: {}\nDescription: {}\nTimestamp: {}\n=====================\n\n",
            state.label(),
            state.description(),
            now.format("%Y-%m-%d %H:%M:%S")
        );

        let mut ranked: Vec<&ContextKey> = self.keys().iter().collect();
        ranked.sort_by_key(|k| Reverse(context_priority(k, state, now)));

        let mut included = 0;
        for key in ranked {
            if out.len() >= budget {
                break;
            }
            if out.len() + key.data_size > budget * 11 / 10 {
                continue;
            }
            let data = match self.peek(&key.name) {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %key.name, error = %e, "context preparation skipped key");
                    continue;
                }
            };
            let _ = write!(
                out,
                "\n--- Context: {} (importance: {}, layer: {}) ---\n{data}\n--- End Context ---\n",
                key.name, key.importance, key.layer
            );
            included += 1;
        }

        let total = out.len();
        let _ = write!(
            out,
            "\n=== CONTEXT SUMMARY ===\nTotal size: {total} characters\nEstimated tokens: {}\n\
             Context keys included: {included}\n=====================\n",
            estimate_tokens(total)
        );
        Ok(out)
    }

    /// Pull keys touched within `threshold_secs` into the working layer and
    /// boost the importance of those below 70 by 20. Returns the number of
    /// keys affected.
    pub fn preserve_recent(&mut self, threshold_secs: i64) -> MemoryResult<usize> {
        if threshold_secs <= 0 {
            return Err(MemoryError::invalid("recency threshold must be positive"));
        }
        let now = self.now();
        let recent: Vec<ContextKey> = self
            .keys()
            .iter()
            .filter(|k| k.age_secs(now) < threshold_secs)
            .cloned()
            .collect();
        let mut affected = 0;
        for key in recent {
            if let Err(e) = self.relocate(&key.name, Layer::Working) {
                warn!(key = %key.name, error = %e, "preserve_recent skipped key");
                continue;
            }
            if key.importance < BOOST_BELOW {
                let boosted = (key.importance + BOOST).min(MAX_IMPORTANCE);
                self.update_importance(&key.name, boosted)?;
            }
            affected += 1;
        }
        Ok(affected)
    }

    /// Escalating response to an over-budget working layer: archive stale
    /// keys, then demote up to 20 keys of importance 60 or less, then trim
    /// (first sparing recent keys, then not). Returns keys affected.
    pub fn manage_overflow(&mut self, max_size: usize) -> MemoryResult<usize> {
        if self.working_size() <= max_size {
            return Ok(0);
        }
        let mut affected = self.cleanup_expired(OVERFLOW_EXPIRY_SECS, true)?;

        if self.working_size() > max_size {
            let mut candidates: Vec<ContextKey> = self
                .keys()
                .iter()
                .filter(|k| k.layer == Layer::Working && k.importance <= OVERFLOW_DEMOTE_MAX_IMPORTANCE)
                .cloned()
                .collect();
            candidates.sort_by_key(|k| (k.importance, k.last_accessed));
            candidates.truncate(OVERFLOW_DEMOTE_BATCH);
            affected += self.demote_until(candidates, max_size);
        }
        if self.working_size() > max_size {
            affected += self.context_window_trim(max_size, true)?;
        }
        if self.working_size() > max_size {
            affected += self.context_window_trim(max_size, false)?;
        }
        info!(event = "overflow_managed", affected, max_size, working_size = self.working_size());
        Ok(affected)
    }

    /// State-specific composition of prioritize and preserve_recent.
    pub fn context_window_optimize(&mut self, state: AgentState) -> MemoryResult<usize> {
        let (keep, recent_secs) = match state {
            AgentState::Thinking => (50, 3600),
            AgentState::Executing => (30, 1800),
            AgentState::Evaluating => (80, 7200),
            AgentState::Paging => (40, 3600),
        };
        let mut affected = self.context_window_prioritize(keep)?;
        affected += self.preserve_recent(recent_secs)?;
        if state == AgentState::Paging {
            affected += self.compact(true)?;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::make_memory;
    use chrono::Duration;

    #[test]
    fn tokens_round_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
    }

    #[test]
    fn calculate_reports_working_usage() {
        let (mut memory, _) = make_memory();
        memory.store("w", &"x".repeat(400), Layer::Working, 10).unwrap();
        memory.store("d", &"x".repeat(999), Layer::Disk, 10).unwrap();
        let info = memory.context_window_calculate();
        assert_eq!(info.current_size, 400);
        assert_eq!(info.key_count, 1);
        assert_eq!(info.estimated_tokens, 100);
    }

    #[test]
    fn trim_demotes_low_importance_first_and_never_deletes() {
        let (mut memory, clock) = make_memory();
        memory.store("low", &"a".repeat(100), Layer::Working, 10).unwrap();
        memory.store("mid", &"b".repeat(100), Layer::Working, 50).unwrap();
        memory.store("vip", &"c".repeat(100), Layer::Working, 90).unwrap();
        clock.advance(Duration::hours(2));

        let moved = memory.context_window_trim(250, true).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(memory.key("low").unwrap().layer, Layer::Disk);
        assert_eq!(memory.key("mid").unwrap().layer, Layer::Working);
        assert_eq!(memory.keys().len(), 3);
        assert_eq!(memory.retrieve("low").unwrap(), "a".repeat(100));
    }

    #[test]
    fn trim_can_spare_recent_keys() {
        let (mut memory, _) = make_memory();
        memory.store("fresh", &"a".repeat(100), Layer::Working, 10).unwrap();
        assert_eq!(memory.context_window_trim(50, true).unwrap(), 0);
        assert_eq!(memory.context_window_trim(50, false).unwrap(), 1);
    }

    #[test]
    fn prioritize_keeps_top_keys_in_working() {
        let (mut memory, _) = make_memory();
        memory.store("a", "x", Layer::Disk, 90).unwrap();
        memory.store("b", "x", Layer::Working, 10).unwrap();
        memory.store("c", "x", Layer::Working, 50).unwrap();
        memory.store("z", "x", Layer::Archived, 99).unwrap();
        memory.context_window_prioritize(2).unwrap();
        assert_eq!(memory.key("a").unwrap().layer, Layer::Working);
        assert_eq!(memory.key("c").unwrap().layer, Layer::Working);
        assert_eq!(memory.key("b").unwrap().layer, Layer::Disk);
        assert_eq!(memory.key("z").unwrap().layer, Layer::Archived);
    }

    #[test]
    fn prepare_llm_orders_by_priority_and_respects_budget() {
        let (mut memory, _) = make_memory();
        memory.store("plan", "ship it", Layer::Working, 90).unwrap();
        memory.store("trivia", "meh", Layer::Disk, 5).unwrap();
        memory.store("huge", &"h".repeat(10_000), Layer::Working, 95).unwrap();
        let text = memory
            .context_window_prepare_llm(AgentState::Executing, 100)
            .unwrap();
        assert!(text.starts_with("=== AGENT CONTEXT ===\nState: EXECUTING"));
        let plan_at = text.find("--- Context: plan").unwrap();
        let trivia_at = text.find("--- Context: trivia").unwrap();
        assert!(plan_at < trivia_at);
        assert!(!text.contains("--- Context: huge"));
        assert!(text.contains("Context keys included: 2"));
        assert!(memory.context_window_prepare_llm(AgentState::Paging, 0).is_err());
    }

    #[test]
    fn preserve_recent_promotes_and_boosts() {
        let (mut memory, clock) = make_memory();
        memory.store("old", "x", Layer::Disk, 10).unwrap();
        clock.advance(Duration::hours(3));
        memory.store("new", "y", Layer::Disk, 60).unwrap();
        memory.store("new_vip", "z", Layer::Archived, 75).unwrap();
        assert_eq!(memory.preserve_recent(3600).unwrap(), 2);
        assert_eq!(memory.key("new").unwrap().layer, Layer::Working);
        assert_eq!(memory.key("new").unwrap().importance, 80);
        assert_eq!(memory.key("new_vip").unwrap().importance, 75);
        assert_eq!(memory.key("old").unwrap().layer, Layer::Disk);
        assert_eq!(memory.retrieve("new_vip").unwrap(), "z");
    }

    #[test]
    fn manage_overflow_escalates() {
        let (mut memory, clock) = make_memory();
        memory.store("stale", &"s".repeat(100), Layer::Working, 20).unwrap();
        clock.advance(Duration::days(10));
        memory.store("mid", &"m".repeat(100), Layer::Working, 55).unwrap();
        memory.store("keep", &"k".repeat(100), Layer::Working, 90).unwrap();
        let affected = memory.manage_overflow(150).unwrap();
        assert_eq!(affected, 2);
        assert_eq!(memory.key("stale").unwrap().layer, Layer::Archived);
        assert_eq!(memory.key("mid").unwrap().layer, Layer::Disk);
        assert_eq!(memory.key("keep").unwrap().layer, Layer::Working);
        assert_eq!(memory.manage_overflow(150).unwrap(), 0);
    }

    #[test]
    fn optimize_for_paging_compacts() {
        let (mut memory, clock) = make_memory();
        memory.store("ancient", "x", Layer::Disk, 10).unwrap();
        clock.advance(Duration::days(8));
        memory.store("now", "y", Layer::Disk, 10).unwrap();
        memory.context_window_optimize(AgentState::Paging).unwrap();
        assert_eq!(memory.key("now").unwrap().layer, Layer::Working);
        assert_eq!(memory.key("ancient").unwrap().layer, Layer::Archived);
        assert_eq!(memory.key("now").unwrap().importance, 30);
    }
}
