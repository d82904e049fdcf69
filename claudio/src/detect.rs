//! Agent state detection from captured terminal buffers
//!
//! Pure classification: no I/O, no timers. The supervisor owns stale/timeout
//! tracking; this module only decides what the visible buffer says the agent
//! is doing right now.

/// Classified runtime state of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Actively producing output
    Working,
    /// Blocked on a permission/confirmation prompt
    WaitingPermission,
    /// Blocked on an interactive question
    WaitingQuestion,
    /// Idle at a prompt, waiting for free-form input
    WaitingInput,
    /// The agent printed its completion summary
    Completed,
    /// The agent printed an error / stack trace / fatal marker
    Error,
}

/// How many lines from the bottom of the buffer the rules inspect
const SCAN_LINES: usize = 12;

/// Permission / confirmation prompt markers
const PERMISSION_MARKERS: &[&str] = &[
    "Do you want to",
    "Would you like to",
    "Allow this",
    "(y/n)",
    "[y/N]",
    "[Y/n]",
    "1. Yes",
    "Grant access",
];

/// Interactive question markers (agent asking the user to choose or answer)
const QUESTION_MARKERS: &[&str] = &[
    "Please choose",
    "Select an option",
    "Which of the following",
    "Enter your",
    "What would you like",
];

/// Characteristic completion markers
const COMPLETION_MARKERS: &[&str] = &[
    "Task complete",
    "All done",
    "Summary of changes",
    "✻ Done",
    "Finished successfully",
];

/// Error / fatal markers
const ERROR_MARKERS: &[&str] = &[
    "Error:",
    "error:",
    "FATAL",
    "fatal:",
    "panicked at",
    "Traceback (most recent call last)",
    "Unhandled exception",
];

/// Prompt glyphs that indicate an idle input line when the buffer is quiet
const PROMPT_SUFFIXES: &[&str] = &["> ", "$ ", "❯ ", ">"];

/// Classify a buffer snapshot
///
/// `previous` is the snapshot from the prior tick (None on the first capture)
/// and `previous_state` the prior classification. Priority when several rules
/// match: Error > Completed > WaitingPermission > WaitingQuestion >
/// WaitingInput > Working. Completion is sticky: once Completed, the state
/// stays Completed until the supervisor resets it on restart.
pub fn classify(current: &str, previous: Option<&str>, previous_state: AgentState) -> AgentState {
    // Sticky completion prevents status flicker while the finished agent's
    // screen scrolls or redraws.
    if previous_state == AgentState::Completed {
        return AgentState::Completed;
    }

    let tail = bottom_lines(current, SCAN_LINES);

    if contains_any(&tail, ERROR_MARKERS) {
        return AgentState::Error;
    }
    if contains_any(&tail, COMPLETION_MARKERS) {
        return AgentState::Completed;
    }
    if contains_any(&tail, PERMISSION_MARKERS) {
        return AgentState::WaitingPermission;
    }
    if contains_any(&tail, QUESTION_MARKERS) {
        return AgentState::WaitingQuestion;
    }

    // A bare prompt only counts as waiting-for-input when nothing changed
    // since the previous snapshot; during active output a prompt glyph can
    // scroll past the bottom lines transiently.
    let quiet = previous.is_some_and(|p| p == current);
    if quiet && ends_at_prompt(&tail) {
        return AgentState::WaitingInput;
    }

    AgentState::Working
}

/// Last `n` non-empty-ish lines of the buffer, preserving order
fn bottom_lines(buffer: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = buffer.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

fn contains_any(lines: &[&str], markers: &[&str]) -> bool {
    lines.iter().any(|line| markers.iter().any(|m| line.contains(m)))
}

/// True when the last non-blank line ends with a prompt glyph
fn ends_at_prompt(lines: &[&str]) -> bool {
    let Some(last) = lines.iter().rev().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    let trimmed = last.trim_end();
    PROMPT_SUFFIXES
        .iter()
        .any(|p| last.ends_with(p) || trimmed.ends_with(p.trim_end()))
        && trimmed.len() <= 80
}
