//! Rendering - pure projection of the model onto the frame
//!
//! No state mutation beyond recording the output viewport height the
//! scroll math depends on.

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Paragraph};

use crate::session::InstanceStatus;

use super::model::{Mode, Model};

/// Render the whole UI
pub fn render(model: &mut Model, frame: &mut Frame) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(2)])
        .split(frame.area());

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(32), Constraint::Min(20)])
        .split(chunks[0]);

    render_sidebar(model, frame, body[0]);
    if model.show_terminal && model.mode == Mode::Terminal {
        render_terminal(model, frame, body[1]);
    } else {
        render_output(model, frame, body[1]);
    }
    render_status(model, frame, chunks[1]);

    if model.show_help {
        render_help(frame);
    }
    if model.show_stats {
        render_stats(model, frame);
    }
    if model.show_conflicts {
        render_conflicts(model, frame);
    }
    if model.mode == Mode::PlanEditor {
        render_plan_editor(model, frame);
    }
}

fn status_style(status: InstanceStatus) -> Style {
    match status {
        InstanceStatus::Working | InstanceStatus::CreatingPr => Style::default().fg(Color::Green),
        InstanceStatus::WaitingInput => Style::default().fg(Color::Yellow),
        InstanceStatus::Completed => Style::default().fg(Color::Blue),
        InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout => Style::default().fg(Color::Red),
        InstanceStatus::Paused | InstanceStatus::Pending => Style::default().fg(Color::DarkGray),
    }
}

fn render_sidebar(model: &Model, frame: &mut Frame, area: Rect) {
    let items: Vec<ListItem> = model
        .instances
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let marker = if row.has_new { "*" } else { " " };
            let mut line = Line::from(vec![
                Span::styled(format!("{} ", row.status.indicator()), status_style(row.status)),
                Span::raw(format!("{}{} ", marker, row.id)),
                Span::styled(truncate(&row.task, 18), Style::default().fg(Color::Gray)),
            ]);
            if i == model.active_tab {
                line = line.style(Style::default().add_modifier(Modifier::REVERSED));
            }
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(" instances "));
    frame.render_widget(list, area);
}

fn render_output(model: &mut Model, frame: &mut Frame, area: Rect) {
    let inner_height = area.height.saturating_sub(2) as usize;
    model.output_height = inner_height.max(1);

    let (title, text) = match model.active_instance() {
        Some(row) => {
            let state = model.outputs.state(&row.id);
            let text = state.map(|s| s.text.clone()).unwrap_or_default();
            (format!(" {} - {} ", row.id, truncate(&row.task, 40)), text)
        }
        None => (" no instances ".to_string(), String::new()),
    };

    let all_lines: Vec<&str> = text.lines().collect();
    let visible: Vec<&str> = if model.filter.is_passthrough() {
        all_lines.clone()
    } else {
        model.filter.apply(&all_lines)
    };

    let offset = model
        .active_instance_id()
        .and_then(|id| model.outputs.state(&id))
        .map(|s| s.scroll_offset.min(visible.len().saturating_sub(1)))
        .unwrap_or(0);

    let window: Vec<Line> = visible
        .iter()
        .skip(offset)
        .take(inner_height)
        .map(|l| highlight_line(model, l))
        .collect();

    let paragraph = Paragraph::new(window).block(Block::default().borders(Borders::ALL).title(title));
    frame.render_widget(paragraph, area);
}

/// Dim lines that do not match the active search
fn highlight_line<'a>(model: &Model, line: &'a str) -> Line<'a> {
    if model.search.is_active() && !model.search.raw_pattern().is_empty() {
        let pattern = model.search.raw_pattern().trim_start_matches("r:");
        if line.contains(pattern) {
            return Line::styled(line, Style::default().add_modifier(Modifier::BOLD));
        }
    }
    Line::raw(line)
}

fn render_terminal(model: &mut Model, frame: &mut Frame, area: Rect) {
    let inner_height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = model
        .terminal_output
        .lines()
        .rev()
        .take(inner_height)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(Line::raw)
        .collect();
    let paragraph = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" terminal "));
    frame.render_widget(paragraph, area);
}

fn render_status(model: &Model, frame: &mut Frame, area: Rect) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(1)])
        .split(area);

    // Banner line: errors never silently replace info, the colour changes
    let banner = if let Some(error) = &model.error_message {
        Line::styled(error.clone(), Style::default().fg(Color::Red))
    } else if let Some(info) = &model.info_message {
        Line::styled(info.clone(), Style::default().fg(Color::Cyan))
    } else if let Some(status) = &model.workflow_status {
        Line::styled(status.clone(), Style::default().fg(Color::Magenta))
    } else {
        Line::raw("")
    };
    frame.render_widget(Paragraph::new(banner), rows[0]);

    let mode_line = match model.mode {
        Mode::Command => format!(":{}", model.command_buffer),
        Mode::Search => format!("/{}", model.search_buffer),
        Mode::Filter => format!("filter: {} (1-5 toggle categories)", model.filter_buffer),
        Mode::TaskInput => format!("task: {}", model.task_buffer),
        Mode::Input => "INPUT (Esc to leave)".to_string(),
        Mode::Terminal => "TERMINAL (Esc to leave)".to_string(),
        Mode::PlanEditor => "PLAN (Enter approve, Esc cancel)".to_string(),
        Mode::Normal => "?:help  ::cmd  /:search  i:input  a:task  q:quit".to_string(),
    };
    frame.render_widget(
        Paragraph::new(Line::styled(mode_line, Style::default().fg(Color::DarkGray))),
        rows[1],
    );
}

fn overlay(frame: &mut Frame, width_pct: u16, height_pct: u16) -> Rect {
    let area = frame.area();
    let w = area.width * width_pct / 100;
    let h = area.height * height_pct / 100;
    let rect = Rect {
        x: area.x + (area.width - w) / 2,
        y: area.y + (area.height - h) / 2,
        width: w,
        height: h,
    };
    frame.render_widget(Clear, rect);
    rect
}

fn render_help(frame: &mut Frame) {
    let rect = overlay(frame, 60, 70);
    let text = vec![
        Line::raw("q / Ctrl+C     quit"),
        Line::raw("Tab / h l      switch instance"),
        Line::raw("j k / arrows   scroll"),
        Line::raw("gg / G         top / bottom"),
        Line::raw("gn gp gc gs    group commands"),
        Line::raw("/ n N          search, next, prev"),
        Line::raw("f              filter (1-5 categories, text regex)"),
        Line::raw("i              forward input to instance"),
        Line::raw("t              side terminal"),
        Line::raw("a              add task"),
        Line::raw("p Ctrl+R ^X D  pause, restart, kill, remove"),
        Line::raw(""),
        Line::raw(":ts <task>     triple-shot"),
        Line::raw(":adv <task>    adversarial rounds"),
        Line::raw(":mp <obj>      multi-plan"),
        Line::raw(":up <obj>      ultra-plan (--multi-pass, --file)"),
        Line::raw(":r             resume paused consolidation"),
        Line::raw(":continue/retry/abort   layer decision"),
    ];
    let paragraph = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title(" help "));
    frame.render_widget(paragraph, rect);
}

fn render_stats(model: &Model, frame: &mut Frame) {
    let rect = overlay(frame, 50, 40);
    let lines = match &model.stats {
        Some(m) => vec![
            Line::raw(format!("instances:  {}", m.total)),
            Line::raw(format!("working:    {}", m.working)),
            Line::raw(format!("waiting:    {}", m.waiting)),
            Line::raw(format!("completed:  {}", m.completed)),
            Line::raw(format!("failed:     {}", m.failed)),
            Line::raw(""),
            Line::raw(format!("tokens in:  {}", m.tokens_in)),
            Line::raw(format!("tokens out: {}", m.tokens_out)),
            Line::raw(format!("api calls:  {}", m.api_calls)),
            Line::raw(format!("cost:       ${:.2}", m.cost_usd)),
        ],
        None => vec![Line::raw("no data yet")],
    };
    let paragraph = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" session stats "));
    frame.render_widget(paragraph, rect);
}

fn render_conflicts(model: &Model, frame: &mut Frame) {
    let rect = overlay(frame, 70, 50);
    let lines: Vec<Line> = if model.conflicts.is_empty() {
        vec![Line::raw("no conflicts between live worktrees")]
    } else {
        model
            .conflicts
            .iter()
            .map(|c| {
                Line::raw(format!(
                    "{}  <- {}",
                    c.relative_path,
                    c.instance_ids.join(", ")
                ))
            })
            .collect()
    };
    let paragraph = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" conflicts "));
    frame.render_widget(paragraph, rect);
}

fn render_plan_editor(model: &Model, frame: &mut Frame) {
    let rect = overlay(frame, 80, 80);
    let Some(editor) = &model.plan_editor else {
        return;
    };

    let mut lines = vec![
        Line::styled(
            format!("objective: {}", editor.plan.objective),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Line::raw(""),
    ];
    for (i, task) in editor.plan.tasks.iter().enumerate() {
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!("  (after {})", task.depends_on.join(", "))
        };
        let line = Line::raw(format!("{}: {}{}", task.id, task.title, deps));
        lines.push(if i == editor.selected {
            line.style(Style::default().add_modifier(Modifier::REVERSED))
        } else {
            line
        });
    }

    let paragraph = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" plan review "));
    frame.render_widget(paragraph, rect);
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max.saturating_sub(1)) {
        Some((idx, _)) if s.len() > max => format!("{}…", &s[..idx]),
        _ => s.to_string(),
    }
}
