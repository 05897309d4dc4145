//! Multi-criteria search over the key directory with relevance ranking.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::directory::{ContextKey, Layer, MAX_IMPORTANCE};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::TaggedMemory;

/// Cap applied by [`TaggedMemory::query_summary`].
pub const SUMMARY_MAX_RESULTS: usize = 100;
const PREVIEW_CHARS: usize = 100;

/// Filter for [`TaggedMemory::query`]. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCriteria {
    /// Glob over key names (`*`, `?`, `[...]`). Empty matches everything.
    pub pattern: String,
    /// `None` matches every layer.
    pub layer: Option<Layer>,
    pub min_importance: u8,
    pub max_importance: u8,
    /// Inclusive bounds on `last_accessed`.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` or `Some(0)` means unlimited.
    pub max_results: Option<usize>,
}

impl Default for QueryCriteria {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            layer: None,
            min_importance: 0,
            max_importance: MAX_IMPORTANCE,
            start_time: None,
            end_time: None,
            max_results: None,
        }
    }
}

impl QueryCriteria {
    /// Criteria that match every key.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_string();
        self
    }

    pub fn in_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_importance(mut self, min: u8, max: u8) -> Self {
        self.min_importance = min;
        self.max_importance = max;
        self
    }

    pub fn after(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn before(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.max_results = Some(limit);
        self
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.min_importance > MAX_IMPORTANCE || self.max_importance > MAX_IMPORTANCE {
            return Err(MemoryError::invalid(format!(
                "importance bounds must be within 0..={MAX_IMPORTANCE}"
            )));
        }
        if self.min_importance > self.max_importance {
            return Err(MemoryError::invalid(format!(
                "min importance {} exceeds max {}",
                self.min_importance, self.max_importance
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(MemoryError::invalid("time range start is after its end"));
            }
        }
        Ok(())
    }

    fn has_full_importance_range(&self) -> bool {
        self.min_importance == 0 && self.max_importance == MAX_IMPORTANCE
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub key: ContextKey,
    pub data: String,
    pub relevance: u8,
}

/// Composite score in `0..=100`: importance 40%, recency 30% (bucketed),
/// layer preference 20%, size 10% (smaller is better).
pub fn relevance(key: &ContextKey, now: DateTime<Utc>) -> u8 {
    let importance = u32::from(key.importance) * 40 / 100;
    let recency = match key.age_secs(now) {
        age if age < 3_600 => 30,
        age if age < 86_400 => 25,
        age if age < 604_800 => 20,
        age if age < 2_592_000 => 15,
        _ => 10,
    };
    let layer = match key.layer {
        Layer::Working => 20,
        Layer::Disk => 15,
        Layer::Archived => 10,
    };
    let size = match key.data_size {
        s if s < 1_024 => 10,
        s if s < 10_240 => 8,
        s if s < 102_400 => 6,
        _ => 4,
    };
    (importance + recency + layer + size).min(100) as u8
}

/// Whether `key` passes every filter in `criteria`.
pub fn matches(key: &ContextKey, criteria: &QueryCriteria) -> bool {
    if !criteria.pattern.is_empty() && !glob_match(&criteria.pattern, &key.name) {
        return false;
    }
    if criteria.layer.is_some_and(|layer| layer != key.layer) {
        return false;
    }
    if key.importance < criteria.min_importance || key.importance > criteria.max_importance {
        return false;
    }
    if criteria.start_time.is_some_and(|start| key.last_accessed < start) {
        return false;
    }
    if criteria.end_time.is_some_and(|end| key.last_accessed > end) {
        return false;
    }
    true
}

/// Match `value` against a shell-style glob. `*` and `?` match any
/// character (including `/`); `[abc]`, `[a-z]` and `[!x]` match one
/// character from a class.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();

    let mut pi = 0usize;
    let mut vi = 0usize;
    let mut last_star: Option<usize> = None;
    let mut last_match_vi = 0usize;

    while vi < v.len() {
        if pi < p.len() && p[pi] == '*' {
            last_star = Some(pi);
            pi += 1;
            last_match_vi = vi;
            continue;
        }

        if pi < p.len() {
            let step = match p[pi] {
                '?' => Some(pi + 1),
                '[' => match class_match(&p, pi, v[vi]) {
                    Some((true, next)) => Some(next),
                    Some((false, _)) => None,
                    None => (v[vi] == '[').then_some(pi + 1),
                },
                c => (c == v[vi]).then_some(pi + 1),
            };
            if let Some(next) = step {
                pi = next;
                vi += 1;
                continue;
            }
        }

        if let Some(star_idx) = last_star {
            last_match_vi += 1;
            vi = last_match_vi;
            pi = star_idx + 1;
            continue;
        }

        return false;
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Evaluate the bracket class starting at `p[start] == '['` against `c`.
/// Returns `(matched, index after the class)`, or `None` if the class is
/// unterminated and the `[` should be taken literally.
fn class_match(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() && (first || p[i] != ']') {
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

fn rank(results: &mut [QueryResult]) {
    results.sort_by_key(|r| {
        (
            Reverse(r.relevance),
            Reverse(r.key.importance),
            Reverse(r.key.last_accessed),
        )
    });
}

impl TaggedMemory {
    /// Run `criteria` over the directory and return ranked hits.
    ///
    /// All matches are scored and sorted (relevance, then importance, then
    /// recency, all descending) before the cap of
    /// `min(max_results, criteria.max_results)` is applied; a zero on
    /// either side means no cap from that side. Keys whose bytes cannot be read are skipped.
    /// Queries do not refresh recency.
    pub fn query(
        &self,
        criteria: &QueryCriteria,
        max_results: usize,
    ) -> MemoryResult<Vec<QueryResult>> {
        criteria.validate()?;
        let now = self.now();
        let mut results = Vec::new();
        for key in self.keys().iter().filter(|k| matches(k, criteria)) {
            match self.peek(&key.name) {
                Ok(data) => results.push(QueryResult {
                    relevance: relevance(key, now),
                    key: key.clone(),
                    data,
                }),
                Err(e) => warn!(key = %key.name, error = %e, "query skipped unreadable key"),
            }
        }
        rank(&mut results);

        let cap = match (max_results, criteria.max_results.filter(|c| *c > 0)) {
            (0, None) => usize::MAX,
            (0, Some(c)) => c,
            (m, None) => m,
            (m, Some(c)) => m.min(c),
        };
        results.truncate(cap);
        debug!(pattern = %criteria.pattern, hits = results.len(), "query");
        Ok(results)
    }

    pub fn query_by_tag(&self, pattern: &str, max_results: usize) -> MemoryResult<Vec<QueryResult>> {
        if pattern.is_empty() {
            return Err(MemoryError::invalid("tag pattern is empty"));
        }
        self.query(&QueryCriteria::all().with_pattern(pattern), max_results)
    }

    pub fn query_by_importance(
        &self,
        min: u8,
        max: u8,
        max_results: usize,
    ) -> MemoryResult<Vec<QueryResult>> {
        self.query(&QueryCriteria::all().with_importance(min, max), max_results)
    }

    pub fn query_by_timerange(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_results: usize,
    ) -> MemoryResult<Vec<QueryResult>> {
        self.query(&QueryCriteria::all().after(start).before(end), max_results)
    }

    /// Fetch a single key as a scored result. Counts as an access.
    pub fn query_by_context_key(&mut self, name: &str) -> MemoryResult<QueryResult> {
        let data = self.retrieve(name)?;
        let key = self.find_key(name)?;
        Ok(QueryResult {
            relevance: relevance(&key, self.now()),
            key,
            data,
        })
    }

    /// Keys that look related to `reference` by name, in the same layer.
    ///
    /// The pattern is the name up to its first `_` followed by `*`, or the
    /// first half of the name followed by `*` when there is no underscore.
    /// The reference key itself is never returned.
    pub fn query_related(&self, reference: &str, max_results: usize) -> MemoryResult<Vec<QueryResult>> {
        let key = self
            .key(reference)
            .ok_or_else(|| MemoryError::not_found(format!("key {reference}")))?;
        let criteria = QueryCriteria::all()
            .with_pattern(&related_pattern(&key.name))
            .in_layer(key.layer);
        let mut results = self.query(&criteria, 0)?;
        results.retain(|r| r.key.name != reference);
        if max_results > 0 {
            results.truncate(max_results);
        }
        Ok(results)
    }

    /// Human-readable digest of up to 100 hits for `criteria`.
    pub fn query_summary(&self, criteria: &QueryCriteria) -> MemoryResult<String> {
        let results = self.query(criteria, SUMMARY_MAX_RESULTS)?;
        let mut out = String::new();
        let layer = criteria.layer.map_or("any", Layer::as_str);
        let pattern = if criteria.pattern.is_empty() {
            "*"
        } else {
            criteria.pattern.as_str()
        };
        let _ = write!(
            out,
            "Memory Query Summary\n==================\nPattern: {pattern}\nLayer: {layer}\n\
             Importance: {}-{}\nResults: {}\n\n",
            criteria.min_importance,
            criteria.max_importance,
            results.len()
        );
        for (i, r) in results.iter().enumerate() {
            let preview: String = r.data.chars().take(PREVIEW_CHARS).collect();
            let ellipsis = if r.data.chars().count() > PREVIEW_CHARS {
                "..."
            } else {
                ""
            };
            let _ = write!(
                out,
                "{}. Key: {}\n   Layer: {} | Importance: {} | Size: {} bytes\n   \
                 Last Accessed: {} | Relevance: {}%\n   Preview: {preview}{ellipsis}\n\n",
                i + 1,
                r.key.name,
                r.key.layer,
                r.key.importance,
                r.key.data_size,
                r.key.last_accessed.format("%Y-%m-%d %H:%M:%S"),
                r.relevance,
            );
        }
        Ok(out)
    }

    /// Narrow `criteria` to bound query cost on a large directory.
    ///
    /// Only ever adds restrictions; never touches the directory.
    pub fn optimize_criteria(&self, criteria: &QueryCriteria) -> QueryCriteria {
        let count = self.keys().len();
        let mut tuned = criteria.clone();
        if tuned.pattern.is_empty() && tuned.layer.is_none() && count > 100 {
            tuned.layer = Some(Layer::Working);
        }
        if tuned.start_time.is_none() && tuned.end_time.is_none() && count > 500 {
            tuned.start_time = Some(self.now() - Duration::days(7));
        }
        if !matches!(tuned.max_results, Some(c) if c > 0) {
            tuned.max_results = Some(if count > 1000 { 50 } else { 100 });
        }
        if tuned.has_full_importance_range() && count > 200 {
            tuned.min_importance = 50;
        }
        tuned
    }
}

fn related_pattern(name: &str) -> String {
    if let Some(idx) = name.find('_') {
        return format!("{}*", &name[..idx]);
    }
    let chars: Vec<char> = name.chars().collect();
    let half = chars.len() / 2;
    if half == 0 {
        return name.to_string();
    }
    let prefix: String = chars[..half].iter().collect();
    format!("{prefix}*")
}
