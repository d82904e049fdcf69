//! Category and regex filtering of instance output
//!
//! Each category has a heuristic line matcher. A line passes when the
//! custom regex (if set) matches AND no disabled category matches it.

use regex::{Regex, RegexBuilder};
use tracing::debug;

/// Toggleable output categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCategory {
    Errors,
    Warnings,
    Tools,
    Thinking,
    Progress,
}

impl FilterCategory {
    pub const ALL: [FilterCategory; 5] = [
        Self::Errors,
        Self::Warnings,
        Self::Tools,
        Self::Thinking,
        Self::Progress,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Errors => "errors",
            Self::Warnings => "warnings",
            Self::Tools => "tools",
            Self::Thinking => "thinking",
            Self::Progress => "progress",
        }
    }

    /// Heuristic: does this line belong to the category?
    fn matches(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        match self {
            Self::Errors => lower.contains("error") || lower.contains("failed") || lower.contains("panic"),
            Self::Warnings => lower.contains("warn"),
            Self::Tools => {
                line.trim_start().starts_with('⏺')
                    || lower.contains("running tool")
                    || lower.contains("[tool]")
                    || lower.starts_with("$ ")
            }
            Self::Thinking => line.trim_start().starts_with('✻') || lower.contains("thinking"),
            Self::Progress => {
                lower.contains("...") && (lower.contains("ing ") || lower.ends_with("..."))
                    || lower.contains('%')
            }
        }
    }
}

/// Filter state: per-category toggles plus an optional user regex
#[derive(Debug)]
pub struct FilterEngine {
    enabled: [bool; 5],
    raw_regex: String,
    regex: Option<Regex>,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self {
            enabled: [true; 5],
            raw_regex: String::new(),
            regex: None,
        }
    }
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(category: FilterCategory) -> usize {
        FilterCategory::ALL.iter().position(|c| *c == category).unwrap()
    }

    pub fn is_enabled(&self, category: FilterCategory) -> bool {
        self.enabled[Self::index(category)]
    }

    /// Toggle a category on/off
    pub fn toggle(&mut self, category: FilterCategory) {
        let i = Self::index(category);
        self.enabled[i] = !self.enabled[i];
        debug!(category = category.label(), enabled = self.enabled[i], "FilterEngine::toggle");
    }

    /// Set the user regex (case-insensitive); invalid patterns clear it
    pub fn set_regex(&mut self, raw: &str) {
        self.raw_regex = raw.to_string();
        self.regex = if raw.is_empty() {
            None
        } else {
            match RegexBuilder::new(raw).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!(%raw, error = %e, "FilterEngine::set_regex: invalid, clearing");
                    None
                }
            }
        };
    }

    pub fn raw_regex(&self) -> &str {
        &self.raw_regex
    }

    /// Everything enabled and no regex set
    pub fn is_passthrough(&self) -> bool {
        self.enabled.iter().all(|&e| e) && self.regex.is_none()
    }

    /// Whether a line survives the filter
    pub fn line_passes(&self, line: &str) -> bool {
        if let Some(re) = &self.regex {
            if !re.is_match(line) {
                return false;
            }
        }
        for (i, category) in FilterCategory::ALL.iter().enumerate() {
            if !self.enabled[i] && category.matches(line) {
                return false;
            }
        }
        true
    }

    /// Filter a full buffer into the surviving lines
    pub fn apply<'a>(&self, lines: &[&'a str]) -> Vec<&'a str> {
        lines.iter().copied().filter(|l| self.line_passes(l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_by_default() {
        let f = FilterEngine::new();
        assert!(f.is_passthrough());
        assert!(f.line_passes("Error: anything at all"));
    }

    #[test]
    fn test_disabled_category_hides_lines() {
        let mut f = FilterEngine::new();
        f.toggle(FilterCategory::Errors);
        assert!(!f.line_passes("Error: missing file"));
        assert!(!f.line_passes("build failed"));
        assert!(f.line_passes("compiling core"));
    }

    #[test]
    fn test_toggle_is_reversible() {
        let mut f = FilterEngine::new();
        f.toggle(FilterCategory::Warnings);
        assert!(!f.line_passes("warn: unused import"));
        f.toggle(FilterCategory::Warnings);
        assert!(f.line_passes("warn: unused import"));
    }

    #[test]
    fn test_regex_and_categories_combine() {
        let mut f = FilterEngine::new();
        f.set_regex("core");
        f.toggle(FilterCategory::Errors);

        // Matches regex, not an error line: passes
        assert!(f.line_passes("compiling core"));
        // Matches regex but is an error line: hidden
        assert!(!f.line_passes("error in core module"));
        // Error category enabled-check irrelevant when regex misses
        assert!(!f.line_passes("compiling shell"));
    }

    #[test]
    fn test_regex_case_insensitive() {
        let mut f = FilterEngine::new();
        f.set_regex("TODO");
        assert!(f.line_passes("found a todo item"));
    }

    #[test]
    fn test_invalid_regex_cleared() {
        let mut f = FilterEngine::new();
        f.set_regex("([bad");
        assert!(f.is_passthrough());
        assert!(f.line_passes("anything"));
    }

    #[test]
    fn test_apply() {
        let mut f = FilterEngine::new();
        f.toggle(FilterCategory::Warnings);
        let lines = vec!["ok line", "warn: hidden", "another ok"];
        assert_eq!(f.apply(&lines), vec!["ok line", "another ok"]);
    }

    #[test]
    fn test_tool_lines() {
        let mut f = FilterEngine::new();
        f.toggle(FilterCategory::Tools);
        assert!(!f.line_passes("⏺ Read(src/main.rs)"));
        assert!(!f.line_passes("$ cargo build"));
        assert!(f.line_passes("regular output"));
    }
}
