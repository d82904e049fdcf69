//! Per-instance output state - text, scrolling, and the auto-scroll invariant
//!
//! Invariant: auto-scroll is on exactly when the scroll offset equals the
//! current maximum offset. Scrolling up turns it off; reaching the bottom
//! (by scrolling or jumping) turns it back on.

mod filter;
mod search;

use std::collections::HashMap;

pub use filter::{FilterCategory, FilterEngine};
pub use search::SearchEngine;

/// Output state for one instance
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    /// Captured text
    pub text: String,
    /// First visible line index
    pub scroll_offset: usize,
    /// Follow the bottom as new lines arrive
    pub auto_scroll: bool,
    /// Line count at the previous update, used to detect new output
    pub last_line_count: usize,
    /// New lines arrived since the instance was last viewed
    pub has_new: bool,
}

impl OutputState {
    fn new() -> Self {
        Self {
            auto_scroll: true,
            ..Default::default()
        }
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// Maximum scroll offset for a viewport of `height` lines
    pub fn max_scroll(&self, height: usize) -> usize {
        self.line_count().saturating_sub(height)
    }
}

/// Holds output state for every instance
#[derive(Debug, Default)]
pub struct OutputManager {
    states: HashMap<String, OutputState>,
}

impl OutputManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: &str) -> Option<&OutputState> {
        self.states.get(id)
    }

    fn state_entry(&mut self, id: &str) -> &mut OutputState {
        self.states.entry(id.to_string()).or_insert_with(OutputState::new)
    }

    /// Store newly captured output and maintain the scroll position
    ///
    /// With auto-scroll on, the offset advances to the new bottom. Returns
    /// true when new lines arrived.
    pub fn update_output(&mut self, id: &str, text: &str, viewport_height: usize, visible: bool) -> bool {
        let state = self.state_entry(id);
        state.text = text.to_string();

        let line_count = state.line_count();
        let grew = line_count > state.last_line_count;
        state.last_line_count = line_count;

        if grew && !visible {
            state.has_new = true;
        }
        if visible {
            state.has_new = false;
        }

        let max = state.max_scroll(viewport_height);
        if state.auto_scroll {
            state.scroll_offset = max;
        } else {
            state.scroll_offset = state.scroll_offset.min(max);
        }
        grew
    }

    /// Scroll up; disables auto-scroll
    pub fn scroll_up(&mut self, id: &str, lines: usize) {
        let state = self.state_entry(id);
        state.scroll_offset = state.scroll_offset.saturating_sub(lines);
        state.auto_scroll = false;
    }

    /// Scroll down, clamped to the bottom; re-enables auto-scroll exactly at
    /// the bottom
    pub fn scroll_down(&mut self, id: &str, lines: usize, viewport_height: usize) {
        let state = self.state_entry(id);
        let max = state.max_scroll(viewport_height);
        state.scroll_offset = (state.scroll_offset + lines).min(max);
        if state.scroll_offset == max {
            state.auto_scroll = true;
        }
    }

    /// Jump to the top; disables auto-scroll
    pub fn scroll_to_top(&mut self, id: &str) {
        let state = self.state_entry(id);
        state.scroll_offset = 0;
        state.auto_scroll = false;
    }

    /// Jump to the bottom; re-enables auto-scroll
    pub fn scroll_to_bottom(&mut self, id: &str, viewport_height: usize) {
        let state = self.state_entry(id);
        state.scroll_offset = state.max_scroll(viewport_height);
        state.auto_scroll = true;
    }

    /// Set an explicit offset (search-match centering); disables auto-scroll
    /// unless the target is the bottom
    pub fn scroll_to(&mut self, id: &str, offset: usize, viewport_height: usize) {
        let state = self.state_entry(id);
        let max = state.max_scroll(viewport_height);
        state.scroll_offset = offset.min(max);
        state.auto_scroll = state.scroll_offset == max;
    }

    /// Drop state for a removed instance
    pub fn remove(&mut self, id: &str) {
        self.states.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(lines: usize) -> String {
        (0..lines).map(|i| format!("line {}\n", i)).collect()
    }

    const VIEW: usize = 10;

    #[test]
    fn test_auto_scroll_follows_bottom() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(30), VIEW, true);
        let state = mgr.state("i").unwrap();
        assert!(state.auto_scroll);
        assert_eq!(state.scroll_offset, 20);

        mgr.update_output("i", &text(50), VIEW, true);
        assert_eq!(mgr.state("i").unwrap().scroll_offset, 40);
    }

    #[test]
    fn test_scroll_up_disables_auto_scroll() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(30), VIEW, true);
        mgr.scroll_up("i", 5);
        let state = mgr.state("i").unwrap();
        assert!(!state.auto_scroll);
        assert_eq!(state.scroll_offset, 15);

        // New output no longer moves the viewport
        mgr.update_output("i", &text(60), VIEW, true);
        assert_eq!(mgr.state("i").unwrap().scroll_offset, 15);
    }

    #[test]
    fn test_scroll_down_to_bottom_reenables() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(30), VIEW, true);
        mgr.scroll_up("i", 5);

        mgr.scroll_down("i", 3, VIEW);
        assert!(!mgr.state("i").unwrap().auto_scroll);

        // Past the last line clamps to max AND re-enables auto-scroll
        mgr.scroll_down("i", 100, VIEW);
        let state = mgr.state("i").unwrap();
        assert_eq!(state.scroll_offset, 20);
        assert!(state.auto_scroll);
    }

    #[test]
    fn test_invariant_auto_scroll_iff_at_bottom() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(40), VIEW, true);

        for (action, _) in [("up", ()), ("down", ()), ("bottom", ()), ("top", ())] {
            match action {
                "up" => mgr.scroll_up("i", 7),
                "down" => mgr.scroll_down("i", 2, VIEW),
                "bottom" => mgr.scroll_to_bottom("i", VIEW),
                _ => mgr.scroll_to_top("i"),
            }
            let state = mgr.state("i").unwrap();
            assert_eq!(
                state.auto_scroll,
                state.scroll_offset == state.max_scroll(VIEW),
                "after {}",
                action
            );
        }
    }

    #[test]
    fn test_has_new_marker() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(5), VIEW, false);
        // First update grew from 0 lines while not visible
        assert!(mgr.state("i").unwrap().has_new);

        // Viewing clears the marker
        mgr.update_output("i", &text(5), VIEW, true);
        assert!(!mgr.state("i").unwrap().has_new);

        // Growth while visible does not set it
        mgr.update_output("i", &text(8), VIEW, true);
        assert!(!mgr.state("i").unwrap().has_new);
    }

    #[test]
    fn test_short_output_no_scroll() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(3), VIEW, true);
        let state = mgr.state("i").unwrap();
        assert_eq!(state.scroll_offset, 0);
        assert_eq!(state.max_scroll(VIEW), 0);
        assert!(state.auto_scroll);
    }

    #[test]
    fn test_shrinking_output_clamps_offset() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", &text(50), VIEW, true);
        mgr.scroll_up("i", 1); // offset 39, auto off
        // A restart truncates the buffer
        mgr.update_output("i", &text(12), VIEW, true);
        let state = mgr.state("i").unwrap();
        assert_eq!(state.scroll_offset, 2);
    }

    #[test]
    fn test_remove_drops_state() {
        let mut mgr = OutputManager::new();
        mgr.update_output("i", "x", VIEW, true);
        mgr.remove("i");
        assert!(mgr.state("i").is_none());
    }
}
