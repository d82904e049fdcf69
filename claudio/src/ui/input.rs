//! Input routing - key dispatch per interaction mode
//!
//! Mode entry and exit are explicit; at most one mode is active. A single
//! `g` in normal mode arms a pending group command consumed by the next
//! key, so `gg`, `gn`, `gp` form atomic commands.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tracing::debug;

use crate::output::FilterCategory;

use super::command;
use super::model::{InstanceOp, KeyPress, KeySend, KeyTarget, Mode, Model, ModelView};

/// Route one key event into the model
///
/// `view` is the command layer's read snapshot, captured before dispatch.
pub fn handle_key(model: &mut Model, view: &ModelView, key: KeyEvent) {
    debug!(?key, mode = ?model.mode, "handle_key");
    match model.mode {
        Mode::Normal => handle_normal(model, view, key),
        Mode::Command => handle_command(model, view, key),
        Mode::Input => handle_forward(model, key, false),
        Mode::Terminal => handle_forward(model, key, true),
        Mode::Search => handle_search(model, key),
        Mode::Filter => handle_filter(model, key),
        Mode::TaskInput => handle_task_input(model, key),
        Mode::PlanEditor => handle_plan_editor(model, key),
    }
}

fn handle_normal(model: &mut Model, view: &ModelView, key: KeyEvent) {
    // A pending `g` consumes this key as a group command
    if model.pending_group_cmd {
        model.pending_group_cmd = false;
        handle_group_command(model, key);
        return;
    }

    let height = model.output_height;
    match (key.code, key.modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => model.should_quit = true,
        (KeyCode::Char('q'), _) => model.should_quit = true,

        (KeyCode::Char('?'), _) => model.show_help = !model.show_help,
        (KeyCode::Char(':'), _) => {
            model.command_buffer.clear();
            model.mode = Mode::Command;
        }
        (KeyCode::Char('/'), _) => {
            model.search_buffer.clear();
            model.mode = Mode::Search;
        }
        (KeyCode::Char('f'), _) => model.mode = Mode::Filter,
        (KeyCode::Char('i'), _) => {
            if model.active_instance().is_some() {
                model.mode = Mode::Input;
            } else {
                model.set_error("No instance to send input to");
            }
        }
        (KeyCode::Char('t'), _) => {
            model.show_terminal = !model.show_terminal;
            if model.show_terminal {
                model.mode = Mode::Terminal;
            }
        }
        (KeyCode::Char('a'), _) => {
            model.task_buffer.clear();
            model.mode = Mode::TaskInput;
        }

        // === Tab navigation ===
        (KeyCode::Tab, _) | (KeyCode::Char('l'), _) => model.shift_tab(1),
        (KeyCode::BackTab, _) | (KeyCode::Char('h'), _) => model.shift_tab(-1),

        // === Scrolling ===
        (KeyCode::Up, _) | (KeyCode::Char('k'), _) => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_up(&id, 1);
            }
        }
        (KeyCode::Down, _) | (KeyCode::Char('j'), _) => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_down(&id, 1, height);
            }
        }
        (KeyCode::PageUp, _) => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_up(&id, height / 2);
            }
        }
        (KeyCode::PageDown, _) => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_down(&id, height / 2, height);
            }
        }
        (KeyCode::Char('G'), _) => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_to_bottom(&id, height);
            }
        }
        (KeyCode::Char('g'), _) => model.pending_group_cmd = true,

        // === Search navigation ===
        (KeyCode::Char('n'), _) => model.search_step(true),
        (KeyCode::Char('N'), _) => model.search_step(false),

        // === Instance lifecycle ===
        (KeyCode::Char('r'), KeyModifiers::CONTROL) => {
            model.pending_instance_op = Some(InstanceOp::Restart);
        }
        (KeyCode::Char('x'), KeyModifiers::CONTROL) => {
            model.pending_instance_op = Some(InstanceOp::Kill);
        }
        (KeyCode::Char('p'), _) => {
            model.pending_instance_op = Some(InstanceOp::TogglePause);
        }
        (KeyCode::Char('D'), _) => {
            model.pending_instance_op = Some(InstanceOp::Remove);
        }

        (KeyCode::Esc, _) => {
            model.show_help = false;
            model.show_stats = false;
            model.show_diff = false;
            model.show_conflicts = false;
        }
        _ => {
            let _ = view;
        }
    }
}

/// Second key of a `g` chord
fn handle_group_command(model: &mut Model, key: KeyEvent) {
    match key.code {
        // gg: jump to top
        KeyCode::Char('g') => {
            if let Some(id) = model.active_instance_id() {
                model.outputs.scroll_to_top(&id);
            }
        }
        // gn / gp: next / previous instance tab
        KeyCode::Char('n') => model.shift_tab(1),
        KeyCode::Char('p') => model.shift_tab(-1),
        // gc: conflicts panel
        KeyCode::Char('c') => model.show_conflicts = !model.show_conflicts,
        // gs: stats panel
        KeyCode::Char('s') => model.show_stats = !model.show_stats,
        _ => {}
    }
}

fn handle_command(model: &mut Model, view: &ModelView, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            model.command_buffer.clear();
            model.mode = Mode::Normal;
        }
        KeyCode::Enter => {
            let input = std::mem::take(&mut model.command_buffer);
            model.mode = Mode::Normal;
            let result = command::execute(view, &input);
            model.apply(result);
        }
        KeyCode::Backspace => {
            model.command_buffer.pop();
        }
        KeyCode::Char(c) => model.command_buffer.push(c),
        _ => {}
    }
}

/// Forward keys to the active instance or the side terminal
fn handle_forward(model: &mut Model, key: KeyEvent, to_terminal: bool) {
    let target = if to_terminal {
        KeyTarget::SideTerminal
    } else {
        match model.active_instance_id() {
            Some(id) => KeyTarget::Instance(id),
            None => {
                model.mode = Mode::Normal;
                return;
            }
        }
    };

    let press = match (key.code, key.modifiers) {
        // Esc leaves the mode rather than forwarding
        (KeyCode::Esc, _) => {
            model.mode = Mode::Normal;
            if to_terminal {
                model.show_terminal = false;
            }
            return;
        }
        (KeyCode::Char(c), KeyModifiers::CONTROL) => KeyPress::Named(format!("C-{}", c)),
        (KeyCode::Char(c), _) => KeyPress::Literal(c.to_string()),
        (KeyCode::Enter, _) => KeyPress::Named("Enter".to_string()),
        (KeyCode::Tab, _) => KeyPress::Named("Tab".to_string()),
        (KeyCode::Backspace, _) => KeyPress::Named("BSpace".to_string()),
        (KeyCode::Up, _) => KeyPress::Named("Up".to_string()),
        (KeyCode::Down, _) => KeyPress::Named("Down".to_string()),
        (KeyCode::Left, _) => KeyPress::Named("Left".to_string()),
        (KeyCode::Right, _) => KeyPress::Named("Right".to_string()),
        _ => return,
    };

    model.pending_keys.push(KeySend { target, press });
}

fn handle_search(model: &mut Model, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            model.search_buffer.clear();
            model.search.clear();
            model.mode = Mode::Normal;
        }
        KeyCode::Enter => {
            model.apply_search();
            model.mode = Mode::Normal;
        }
        KeyCode::Backspace => {
            model.search_buffer.pop();
        }
        KeyCode::Char(c) => model.search_buffer.push(c),
        _ => {}
    }
}

fn handle_filter(model: &mut Model, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => model.mode = Mode::Normal,
        KeyCode::Enter => {
            let pattern = std::mem::take(&mut model.filter_buffer);
            model.filter.set_regex(&pattern);
            model.mode = Mode::Normal;
        }
        KeyCode::Backspace => {
            model.filter_buffer.pop();
        }
        // Digits toggle categories; other characters build the regex
        KeyCode::Char(c @ '1'..='5') => {
            let category = FilterCategory::ALL[c as usize - '1' as usize];
            model.filter.toggle(category);
        }
        KeyCode::Char(c) => model.filter_buffer.push(c),
        _ => {}
    }
}

fn handle_task_input(model: &mut Model, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            model.task_buffer.clear();
            model.mode = Mode::Normal;
        }
        KeyCode::Enter => {
            let task = std::mem::take(&mut model.task_buffer);
            if !task.trim().is_empty() {
                model.pending_new_task = Some(task.trim().to_string());
            }
            model.mode = Mode::Normal;
        }
        KeyCode::Backspace => {
            model.task_buffer.pop();
        }
        KeyCode::Char(c) => model.task_buffer.push(c),
        _ => {}
    }
}

fn handle_plan_editor(model: &mut Model, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            // Cancelling keeps the plan; selection stays complete
            model.pending_plan_cancel = true;
            model.mode = Mode::Normal;
        }
        KeyCode::Enter | KeyCode::Char('a') => {
            model.pending_approve = true;
            model.mode = Mode::Normal;
        }
        KeyCode::Up | KeyCode::Char('k') => {
            if let Some(editor) = &mut model.plan_editor {
                editor.selected = editor.selected.saturating_sub(1);
            }
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if let Some(editor) = &mut model.plan_editor {
                let max = editor.plan.tasks.len().saturating_sub(1);
                editor.selected = (editor.selected + 1).min(max);
            }
        }
        _ => {}
    }
}
