//! Line-indexed search over instance output
//!
//! Patterns are literal unless prefixed `r:`, which compiles the remainder
//! as a regex. Navigation wraps around the match set in ascending-index
//! order. Invalid regexes clear the search instead of erroring.

use regex::Regex;
use tracing::debug;

/// Compiled search pattern
#[derive(Debug)]
enum Pattern {
    Literal(String),
    Regex(Regex),
}

/// Search state over one output buffer
#[derive(Debug, Default)]
pub struct SearchEngine {
    raw: String,
    pattern: Option<Pattern>,
    /// Matching line indices, ascending
    matches: Vec<usize>,
    /// Position within `matches`
    current: usize,
}

impl SearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pattern and scan `lines`
    ///
    /// An invalid `r:` regex leaves the engine cleared.
    pub fn set_pattern(&mut self, raw: &str, lines: &[&str]) {
        self.raw = raw.to_string();
        self.matches.clear();
        self.current = 0;

        self.pattern = if let Some(expr) = raw.strip_prefix("r:") {
            match Regex::new(expr) {
                Ok(re) => Some(Pattern::Regex(re)),
                Err(e) => {
                    debug!(%raw, error = %e, "SearchEngine::set_pattern: invalid regex, clearing");
                    None
                }
            }
        } else if raw.is_empty() {
            None
        } else {
            Some(Pattern::Literal(raw.to_string()))
        };

        self.rescan(lines);
    }

    /// Re-run the scan after output changed, keeping the pattern
    pub fn rescan(&mut self, lines: &[&str]) {
        let Some(pattern) = &self.pattern else {
            self.matches.clear();
            return;
        };

        self.matches = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| match pattern {
                Pattern::Literal(lit) => line.contains(lit.as_str()),
                Pattern::Regex(re) => re.is_match(line),
            })
            .map(|(i, _)| i)
            .collect();

        if self.current >= self.matches.len() {
            self.current = 0;
        }
    }

    /// Clear pattern and matches
    pub fn clear(&mut self) {
        self.raw.clear();
        self.pattern = None;
        self.matches.clear();
        self.current = 0;
    }

    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn raw_pattern(&self) -> &str {
        &self.raw
    }

    /// Matching line indices in ascending order
    pub fn matches(&self) -> &[usize] {
        &self.matches
    }

    /// Index into the match set of the current match
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Line number of the current match
    pub fn current_line(&self) -> Option<usize> {
        self.matches.get(self.current).copied()
    }

    /// Advance to the next match, wrapping
    pub fn next(&mut self) -> Option<usize> {
        if self.matches.is_empty() {
            return None;
        }
        self.current = (self.current + 1) % self.matches.len();
        self.current_line()
    }

    /// Step to the previous match, wrapping
    pub fn prev(&mut self) -> Option<usize> {
        if self.matches.is_empty() {
            return None;
        }
        self.current = (self.current + self.matches.len() - 1) % self.matches.len();
        self.current_line()
    }

    /// Scroll offset that centers `line` in a viewport of `height`, clamped
    /// to `[0, max_scroll]`
    pub fn center_target(line: usize, height: usize, max_scroll: usize) -> usize {
        line.saturating_sub(height / 2).min(max_scroll)
    }
}
