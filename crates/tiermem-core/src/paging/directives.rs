//! Paging directives embedded in LLM output, and the text heuristics
//! used to talk to the model about memory.
//!
//! Two directive spellings are accepted: `<verb:args>` tags anywhere in
//! the text, and bare `verb:args` lines.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::directory::{Layer, MAX_IMPORTANCE, MAX_KEY_NAME_LEN};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::TaggedMemory;
use crate::query::QueryCriteria;
use crate::state::AgentState;

const VERBS: [&str; 5] = ["move_to_disk", "move_to_working", "archive", "importance", "delete"];
const PAGING_PROMPT_MIN_IMPORTANCE: u8 = 70;
const PAGING_PROMPT_MAX_KEYS: usize = 20;

/// One parsed paging instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    MoveToDisk(String),
    MoveToWorking(String),
    Archive(String),
    Importance(String, u8),
    Delete(String),
}

impl Directive {
    fn parse(verb: &str, args: &str) -> Result<Self, String> {
        let args = args.trim();
        let key = |s: &str| -> Result<String, String> {
            let s = s.trim();
            if s.is_empty() {
                Err(format!("{verb}: missing key name"))
            } else {
                Ok(s.to_string())
            }
        };
        match verb {
            "move_to_disk" => Ok(Self::MoveToDisk(key(args)?)),
            "move_to_working" => Ok(Self::MoveToWorking(key(args)?)),
            "archive" => Ok(Self::Archive(key(args)?)),
            "delete" => Ok(Self::Delete(key(args)?)),
            "importance" => {
                let (name, score) = args
                    .rsplit_once(':')
                    .ok_or_else(|| format!("importance: expected key:score in {args:?}"))?;
                let score: u32 = score
                    .trim()
                    .parse()
                    .map_err(|_| format!("importance: bad score {score:?}"))?;
                if score > u32::from(MAX_IMPORTANCE) {
                    return Err(format!("importance: score {score} above {MAX_IMPORTANCE}"));
                }
                Ok(Self::Importance(key(name)?, score as u8))
            }
            other => Err(format!("unknown directive verb {other:?}")),
        }
    }
}

/// Outcome of [`TaggedMemory::process_directives`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectiveReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Compile `pattern` once into `cell`. A pattern that fails to compile
/// is logged and yields `None` so callers skip the tag scan.
fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "tag pattern failed to compile");
            None
        }
    })
    .as_ref()
}

fn tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"<(move_to_disk|move_to_working|archive|importance|delete):([^<>\n]*)>",
    )
}

fn key_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"<key:([^<>\n]{1,63})>|\[([^\[\]\n]{1,63})\]")
}

/// Extract directives from free text.
///
/// Returns the well-formed directives in text order and a description of
/// every malformed one.
pub fn parse_directives(text: &str) -> (Vec<Directive>, Vec<String>) {
    let mut found = Vec::new();
    let mut malformed = Vec::new();

    if let Some(re) = tag_regex() {
        for caps in re.captures_iter(text) {
            match Directive::parse(&caps[1], &caps[2]) {
                Ok(d) => found.push(d),
                Err(e) => malformed.push(e),
            }
        }
    }

    for line in text.lines().map(str::trim_start) {
        for verb in VERBS {
            if let Some(args) = line.strip_prefix(verb).and_then(|r| r.strip_prefix(':')) {
                match Directive::parse(verb, args) {
                    Ok(d) => found.push(d),
                    Err(e) => malformed.push(e),
                }
                break;
            }
        }
    }
    (found, malformed)
}

/// Key names the text refers to after memory verbs (`remember`, `recall`,
/// `store`, `save`, `context:`, `memory:`, `key:`), quoted or bare.
/// Deduplicated, in order of first appearance.
pub fn identify_keys(text: &str) -> Vec<String> {
    const INDICATORS: [&str; 7] = ["remember", "recall", "store", "save", "context:", "memory:", "key:"];
    let mut keys: Vec<String> = Vec::new();
    for indicator in INDICATORS {
        let mut from = 0;
        while let Some(idx) = text[from..].find(indicator) {
            let at = from + idx;
            from = at + indicator.len();
            let word_start = text[..at]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_');
            let word_end = !indicator.ends_with(|c: char| c.is_alphanumeric())
                || text[from..]
                    .chars()
                    .next()
                    .map_or(true, |c| !c.is_alphanumeric() && c != '_');
            if !word_start || !word_end {
                continue;
            }
            let rest = text[from..].trim_start();
            let candidate = match rest.chars().next() {
                Some(q @ ('"' | '\'')) => rest[1..].find(q).map(|end| &rest[1..1 + end]),
                Some(_) => {
                    let end = rest
                        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-' || c == '.'))
                        .unwrap_or(rest.len());
                    Some(rest[..end].trim_end_matches('.'))
                }
                None => None,
            };
            if let Some(name) = candidate {
                if !name.is_empty() && name.len() <= MAX_KEY_NAME_LEN && !keys.iter().any(|k| k == name) {
                    keys.push(name.to_string());
                }
            }
        }
    }
    keys
}

/// Context key names for an LLM response: explicit `<key:NAME>` or
/// `[NAME]` tags first, then `context_N` names for each topical phrase
/// ("based on", "regarding", ...), else one `llm_response_<unix>` name.
pub fn analyze_context(text: &str, now: DateTime<Utc>) -> Vec<String> {
    let mut names: Vec<String> = key_tag_regex()
        .map(|tags| {
            tags.captures_iter(text)
                .filter_map(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !names.is_empty() {
        return names;
    }

    const PHRASES: [&str; 7] = [
        "based on",
        "according to",
        "in context of",
        "regarding",
        "about",
        "concerning",
        "related to",
    ];
    let lower = text.to_lowercase();
    for phrase in PHRASES {
        if let Some(idx) = lower.find(phrase) {
            let tail = lower[idx + phrase.len()..].trim_start();
            if tail.chars().next().is_some_and(|c| c.is_alphanumeric()) {
                names.push(format!("context_{}", names.len() + 1));
            }
        }
    }
    if names.is_empty() {
        names.push(format!("llm_response_{}", now.timestamp()));
    }
    names
}

fn explicit_importance(content: &str) -> Option<u8> {
    const INDICATORS: [&str; 4] = ["importance:", "priority:", "relevance:", "significance:"];
    let lower = content.to_lowercase();
    for indicator in INDICATORS {
        let Some(idx) = lower.find(indicator) else {
            continue;
        };
        let rest = lower[idx + indicator.len()..].trim_start();
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(score) = digits.parse::<u32>() {
            if score <= u32::from(MAX_IMPORTANCE) {
                return Some(score as u8);
            }
        }
        for (word, score) in [("critical", 95), ("urgent", 90), ("high", 80), ("medium", 60), ("low", 40)] {
            if rest.starts_with(word) {
                return Some(score);
            }
        }
    }
    None
}

/// Heuristic importance in `0..=100` for `content`.
///
/// Starts at 50, adjusts for length, keywords and the optional `context`
/// hint; an explicit `importance: N` (or `priority: high`, ...) in the
/// content overrides the heuristic.
pub fn evaluate_importance(content: &str, context: Option<&str>) -> u8 {
    if let Some(explicit) = explicit_importance(content) {
        return explicit;
    }
    let mut score: i32 = 50;
    match content.len() {
        n if n > 1000 => score += 10,
        n if n < 100 => score -= 10,
        _ => {}
    }
    let lower = content.to_lowercase();
    const HIGH: [&str; 7] = ["critical", "important", "urgent", "error", "failure", "success", "result"];
    const MEDIUM: [&str; 5] = ["note", "remember", "consider", "think", "analyze"];
    if HIGH.iter().any(|w| lower.contains(w)) {
        score += 15;
    }
    if MEDIUM.iter().any(|w| lower.contains(w)) {
        score += 10;
    }
    if let Some(ctx) = context.map(str::to_lowercase) {
        if ctx.contains("critical") || ctx.contains("high priority") {
            score += 20;
        } else if ctx.contains("low priority") || ctx.contains("optional") {
            score -= 15;
        }
    }
    score.clamp(0, i32::from(MAX_IMPORTANCE)) as u8
}

impl TaggedMemory {
    /// Apply every directive found in `llm_text`, one at a time.
    ///
    /// A malformed directive or one that fails to apply is logged and
    /// skipped; the rest still run. Moves and archives relocate bytes.
    pub fn process_directives(&mut self, llm_text: &str) -> DirectiveReport {
        let (directives, malformed) = parse_directives(llm_text);
        let mut report = DirectiveReport {
            applied: 0,
            skipped: malformed.len(),
        };
        for reason in &malformed {
            warn!(reason = %reason, "malformed paging directive skipped");
        }
        for directive in directives {
            let outcome = match &directive {
                Directive::MoveToDisk(k) => self.relocate(k, Layer::Disk),
                Directive::MoveToWorking(k) => self.relocate(k, Layer::Working),
                Directive::Archive(k) => self.relocate(k, Layer::Archived),
                Directive::Importance(k, s) => self.update_importance(k, *s),
                Directive::Delete(k) => self.delete(k),
            };
            match outcome {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(directive = ?directive, error = %e, "paging directive failed");
                    report.skipped += 1;
                }
            }
        }
        info!(event = "directives_processed", applied = report.applied, skipped = report.skipped);
        report
    }

    /// Prompt asking the model for paging directives, describing current
    /// usage and the most important keys.
    pub fn request_paging(&self, state: AgentState, context_limit: usize) -> MemoryResult<String> {
        if context_limit == 0 {
            return Err(MemoryError::invalid("context_limit must be positive"));
        }
        let stats = self.stats();
        let window = self.context_window_calculate();
        let mut out = String::from("MEMORY PAGING REQUEST\n==================\n\nCurrent System State:\n");
        let _ = write!(
            out,
            "- Agent State: {}\n- Context Limit: {context_limit} tokens\n- Current Context Size: {} characters\n\
             - Context Utilization: {:.1}%\n- Total Memory Keys: {}\n\n",
            state.label(),
            window.current_size,
            window.utilization_percent,
            stats.key_count,
        );
        let _ = write!(
            out,
            "Memory Layer Status:\n- Working Memory: {} bytes\n- Disk Memory: {} bytes\n\
             - Archived Memory: {} bytes\n- Total Size: {} bytes\n\n",
            stats.working_size, stats.disk_size, stats.archived_size, stats.total_size
        );
        out.push_str("High Priority Context Keys:\n");
        let criteria = QueryCriteria::all()
            .with_importance(PAGING_PROMPT_MIN_IMPORTANCE, MAX_IMPORTANCE)
            .with_limit(PAGING_PROMPT_MAX_KEYS);
        for hit in self.query(&criteria, PAGING_PROMPT_MAX_KEYS)? {
            let _ = writeln!(
                out,
                "- {} (importance: {}, layer: {})",
                hit.key.name, hit.key.importance, hit.key.layer
            );
        }
        out.push_str(
            "\nPAGING DIRECTIVE REQUEST:\n\
             Please analyze the current memory state and provide paging directives using simple tags:\n\
             - Use <move_to_disk:key_name> to move keys to disk storage\n\
             - Use <move_to_working:key_name> to move keys to working memory\n\
             - Use <archive:key_name> to archive old keys\n\
             - Use <importance:key_name:score> to update importance scores\n\
             - Use <delete:key_name> to remove obsolete keys\n\n\
             Focus on optimizing memory for the current agent state while preserving important context.\n",
        );
        Ok(out)
    }

    /// Names of keys related to `base_key` (see [`TaggedMemory::query_related`]).
    pub fn suggest_relationships(&self, base_key: &str, max: usize) -> MemoryResult<Vec<String>> {
        if base_key.is_empty() {
            return Err(MemoryError::invalid("base key is empty"));
        }
        Ok(self
            .query_related(base_key, max)?
            .into_iter()
            .map(|r| r.key.name)
            .collect())
    }

    /// State-specific storage housekeeping driven by the agent loop.
    ///
    /// * thinking - pull important disk keys used in the last hour into
    ///   working memory
    /// * executing - archive keys idle for a week
    /// * evaluating - push working keys of importance 50 or less to disk
    /// * paging - aggressive compaction
    ///
    /// Returns the number of keys affected.
    pub fn llm_optimize_storage(&mut self, state: AgentState) -> MemoryResult<usize> {
        let now = self.now();
        let affected = match state {
            AgentState::Thinking => {
                let hot: Vec<String> = self
                    .keys()
                    .iter()
                    .filter(|k| {
                        k.layer == Layer::Disk
                            && k.importance >= 80
                            && now - k.last_accessed < Duration::hours(1)
                    })
                    .map(|k| k.name.clone())
                    .collect();
                self.relocate_all(&hot, Layer::Working)
            }
            AgentState::Executing => self.cleanup_expired(7 * 86_400, true)?,
            AgentState::Evaluating => {
                let cold: Vec<String> = self
                    .keys()
                    .iter()
                    .filter(|k| k.layer == Layer::Working && k.importance <= 50)
                    .map(|k| k.name.clone())
                    .collect();
                self.relocate_all(&cold, Layer::Disk)
            }
            AgentState::Paging => self.compact(true)?,
        };
        info!(event = "llm_storage_optimized", state = %state, affected);
        Ok(affected)
    }

    /// Best-effort relocation of several keys. Returns how many moved.
    pub(crate) fn relocate_all(&mut self, names: &[String], target: Layer) -> usize {
        let mut moved = 0;
        for name in names {
            match self.relocate(name, target) {
                Ok(()) => moved += 1,
                Err(e) => warn!(key = %name, error = %e, "relocation skipped key"),
            }
        }
        moved
    }
}
