use crate::{
    config::AppConfig,
    metrics::{self, WindowProgress},
    plans::{PlanConfig, PlanRegistry, PreferenceStore},
    sync::{SyncHandle, SyncState},
    usage::{DashboardSnapshot, ModelUsage, SessionSummary, UsageData},
};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap},
};
use std::{
    io::{self, Stdout},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Handle;

const PROJECT_NAME_LIMIT: usize = 28;
const MIN_TICK: Duration = Duration::from_millis(10);

/// Everything the interactive view needs from the rest of the app.
pub struct TuiContext<S> {
    pub config: Arc<AppConfig>,
    pub sync: SyncHandle,
    pub plans: PlanRegistry,
    pub plan: &'static PlanConfig,
    pub preferences: S,
    pub source: String,
}

pub async fn run<S: PreferenceStore + 'static>(ctx: TuiContext<S>) -> Result<()> {
    let tick_rate = tick_rate(ctx.config.display.redraw_hz);
    let runtime = Handle::current();

    tokio::task::spawn_blocking(move || run_blocking(runtime, ctx, tick_rate)).await?
}

/// Input poll timeout for a redraw rate, floored so a huge rate cannot spin the loop.
fn tick_rate(redraw_hz: u64) -> Duration {
    Duration::from_millis(1000 / redraw_hz.max(1)).max(MIN_TICK)
}

fn run_blocking<S: PreferenceStore>(
    runtime: Handle,
    ctx: TuiContext<S>,
    tick_rate: Duration,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut view = ViewState {
        plan: ctx.plan,
        notice: None,
    };

    let loop_result: Result<()> = (|| -> Result<()> {
        loop {
            let state = ctx.sync.current();
            terminal.draw(|frame| {
                draw_ui(
                    frame,
                    &ctx.source,
                    ctx.config.display.recent_sessions,
                    &state,
                    &view,
                );
            })?;

            if !event::poll(tick_rate)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if key.code == KeyCode::Char('q')
                || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
            {
                break Ok(());
            }

            match key.code {
                KeyCode::Char('r') => {
                    ctx.sync.refresh();
                    view.notice = None;
                }
                KeyCode::Char('p') => {
                    let next = ctx.plans.next_after(view.plan);
                    match runtime.block_on(ctx.plans.select(&ctx.preferences, next.id)) {
                        Ok(plan) => {
                            view.plan = plan;
                            view.notice = Some(format!("Plan set to {}", plan.display_name));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to save plan selection");
                            view.notice = Some(format!("Could not save plan: {err:#}"));
                        }
                    }
                }
                _ => {}
            }
        }
    })();

    let restore_result = restore_terminal(terminal);

    match (loop_result, restore_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(loop_err), Ok(())) => Err(loop_err),
        (Ok(()), Err(restore_err)) => Err(restore_err),
        (Err(loop_err), Err(restore_err)) => Err(loop_err.context(restore_err.to_string())),
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

struct ViewState {
    plan: &'static PlanConfig,
    notice: Option<String>,
}

fn draw_ui(
    frame: &mut Frame,
    source: &str,
    recent_limit: usize,
    state: &SyncState,
    view: &ViewState,
) {
    let banner_height = if state.error.is_some() { 3 } else { 0 };
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(banner_height),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(frame.size());

    render_header(frame, layout[0], source, state, view.plan);
    if let Some(error) = &state.error {
        render_error_banner(frame, layout[1], error, state.snapshot.is_some());
    }

    match &state.snapshot {
        Some(snapshot) => render_dashboard(frame, layout[2], snapshot, view.plan, recent_limit),
        None => {
            let message = if state.is_loading || state.error.is_none() {
                "Loading..."
            } else {
                "No data available"
            };
            let placeholder = Paragraph::new(message)
                .style(Style::default().fg(Color::DarkGray))
                .block(Block::default().borders(Borders::ALL));
            frame.render_widget(placeholder, layout[2]);
        }
    }

    render_footer(frame, layout[3], view.notice.as_deref());
}

fn render_header(
    frame: &mut Frame,
    area: Rect,
    source: &str,
    state: &SyncState,
    plan: &PlanConfig,
) {
    let status = if state.is_loading {
        "Updating...".to_string()
    } else {
        match &state.snapshot {
            Some(snapshot) => format!("Updated {}", format_clock(snapshot.today.last_updated)),
            None => "Waiting for data".to_string(),
        }
    };

    let line = Line::from(vec![
        Span::styled(
            format!("Plan: {} ", plan.display_name),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("({} tokens / window)", format_tokens(plan.token_limit))),
        Span::raw("  |  "),
        Span::styled(status, Style::default().fg(Color::DarkGray)),
    ]);

    let header = Paragraph::new(line).block(
        Block::default()
            .title(format!("Claude Usage - {source}"))
            .borders(Borders::ALL),
    );
    frame.render_widget(header, area);
}

fn render_error_banner(frame: &mut Frame, area: Rect, error: &str, has_snapshot: bool) {
    let suffix = if has_snapshot {
        " (showing last known data, press 'r' to retry)"
    } else {
        " (press 'r' to retry)"
    };
    let banner = Paragraph::new(format!("Error: {error}{suffix}"))
        .style(Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(banner, area);
}

fn render_dashboard(
    frame: &mut Frame,
    area: Rect,
    snapshot: &DashboardSnapshot,
    plan: &PlanConfig,
    recent_limit: usize,
) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(5),
            Constraint::Min(5),
        ])
        .split(area);

    render_summary(frame, layout[0], snapshot);
    render_billing_window(
        frame,
        layout[1],
        metrics::window_progress(&snapshot.billing_windows, plan),
    );

    let lower = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(layout[2]);
    render_model_breakdown(frame, lower[0], &snapshot.today.model_breakdown);
    render_sessions(
        frame,
        lower[1],
        metrics::recent_sessions(snapshot, recent_limit),
    );
}

fn render_summary(frame: &mut Frame, area: Rect, snapshot: &DashboardSnapshot) {
    let header_style = Style::default().add_modifier(Modifier::BOLD);
    let rows = vec![
        build_summary_row("Today", &snapshot.today, header_style),
        build_summary_row("This Week", &snapshot.week, header_style),
        build_summary_row("This Month", &snapshot.month, header_style),
    ];

    let widths = [
        Constraint::Length(12),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(12),
        Constraint::Length(12),
        Constraint::Length(10),
        Constraint::Length(12),
    ];
    let table = Table::new(rows, widths)
        .header(
            Row::new(vec![
                "Period",
                "Input",
                "Output",
                "Cache Write",
                "Cache Read",
                "Total",
                "Cost (USD)",
            ])
            .style(Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED)),
        )
        .block(Block::default().title("Usage Totals").borders(Borders::ALL));

    frame.render_widget(table, area);
}

fn build_summary_row<'a>(label: &'a str, usage: &UsageData, style: Style) -> Row<'a> {
    let tokens = &usage.total_tokens;
    Row::new(vec![
        Cell::from(label).style(style),
        Cell::from(format_tokens(tokens.input_tokens)),
        Cell::from(format_tokens(tokens.output_tokens)),
        Cell::from(format_tokens(tokens.cache_creation_input_tokens)),
        Cell::from(format_tokens(tokens.cache_read_input_tokens)),
        Cell::from(format_tokens(metrics::total_tokens(tokens))),
        Cell::from(format_cost(usage.total_cost_usd)),
    ])
}

fn render_billing_window(frame: &mut Frame, area: Rect, progress: Option<WindowProgress<'_>>) {
    let block = Block::default()
        .title("5-Hour Billing Window")
        .borders(Borders::ALL);

    let Some(progress) = progress else {
        let idle = Paragraph::new("No active billing window")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(idle, area);
        return;
    };

    let inner = block.inner(area);
    frame.render_widget(block, area);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(inner);

    let window = progress.window;
    let time_gauge = Gauge::default()
        .gauge_style(Style::default().fg(Color::Yellow))
        .ratio(progress.time_percent / 100.0)
        .label(format!("{} remaining", progress.remaining));
    frame.render_widget(time_gauge, rows[0]);

    let quota_gauge = Gauge::default()
        .gauge_style(Style::default().fg(quota_color(progress.quota_percent)))
        .ratio(progress.quota_percent / 100.0)
        .label(format!(
            "{} / {} tokens ({:.0}%)",
            format_tokens(window.total_tokens),
            format_tokens(progress.plan.token_limit),
            progress.quota_percent
        ));
    frame.render_widget(quota_gauge, rows[1]);

    let detail = Paragraph::new(format!(
        "Started {}  ·  {}",
        format_clock(window.start_time),
        format_cost(window.cost_usd)
    ));
    frame.render_widget(detail, rows[2]);
}

fn quota_color(percent: f64) -> Color {
    if percent >= 90.0 {
        Color::Red
    } else if percent >= 70.0 {
        Color::Yellow
    } else {
        Color::Green
    }
}

fn render_model_breakdown(frame: &mut Frame, area: Rect, models: &[ModelUsage]) {
    let active = metrics::model_breakdown(models);
    let header = Row::new(vec!["Model", "Tokens", "Cost"]).style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows: Vec<Row> = if active.is_empty() {
        vec![Row::new(vec!["No usage today", "–", "–"])]
    } else {
        active
            .iter()
            .map(|model| {
                Row::new(vec![
                    model_display_name(&model.model),
                    format_tokens(metrics::total_tokens(&model.tokens)),
                    format_cost(model.cost_usd),
                ])
            })
            .collect()
    };

    let widths = [
        Constraint::Min(14),
        Constraint::Length(10),
        Constraint::Length(10),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().title("Models Today").borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn render_sessions(frame: &mut Frame, area: Rect, sessions: &[SessionSummary]) {
    let header = Row::new(vec!["Project", "Started", "Msgs", "Cost"]).style(
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );

    let rows: Vec<Row> = if sessions.is_empty() {
        vec![Row::new(vec!["No sessions today", "–", "–", "–"])]
    } else {
        sessions
            .iter()
            .map(|session| {
                Row::new(vec![
                    truncate_text(project_name(&session.project_path), PROJECT_NAME_LIMIT),
                    format_clock(session.start_time),
                    session.message_count.to_string(),
                    format_cost(session.total_cost_usd),
                ])
            })
            .collect()
    };

    let widths = [
        Constraint::Min(16),
        Constraint::Length(8),
        Constraint::Length(6),
        Constraint::Length(10),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().title("Recent Sessions").borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn render_footer(frame: &mut Frame, area: Rect, notice: Option<&str>) {
    let mut spans = vec![Span::styled(
        "q quit  r refresh  p cycle plan",
        Style::default().fg(Color::DarkGray),
    )];
    if let Some(notice) = notice {
        spans.push(Span::raw("  |  "));
        spans.push(Span::styled(notice.to_string(), Style::default().fg(Color::Cyan)));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn format_tokens(value: u64) -> String {
    if value >= 1_000_000 {
        format!("{:.1}M", value as f64 / 1_000_000.0)
    } else if value >= 1_000 {
        format!("{:.1}K", value as f64 / 1_000.0)
    } else {
        value.to_string()
    }
}

fn format_cost(cost: f64) -> String {
    format!("${:.2}", cost)
}

fn format_clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

/// Short human name for a model id; unknown ids are shown as-is.
fn model_display_name(model: &str) -> String {
    let has = |needles: &[&str]| needles.iter().any(|needle| model.contains(needle));
    let name = if has(&["opus-4-5", "opus-4.5"]) {
        "Opus 4.5"
    } else if has(&["sonnet-4-5", "sonnet-4.5"]) {
        "Sonnet 4.5"
    } else if has(&["sonnet-4-", "sonnet-4."]) {
        "Sonnet 4"
    } else if has(&["haiku-4-5", "haiku-4.5"]) {
        "Haiku 4.5"
    } else if has(&["sonnet"]) {
        "Sonnet 3.5"
    } else if has(&["haiku"]) {
        "Haiku 3.5"
    } else if has(&["opus"]) {
        "Opus 3"
    } else {
        model
    };
    name.to_string()
}

fn project_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("Unknown")
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated = String::new();
    for ch in input.chars().take(max_chars.saturating_sub(1)) {
        truncated.push(ch);
    }
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plans::PLANS,
        usage::{BillingWindow, TokenUsage},
    };
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ratatui::backend::TestBackend;

    #[test]
    fn tick_rate_follows_redraw_hz_with_a_floor() {
        assert_eq!(tick_rate(4), Duration::from_millis(250));
        assert_eq!(tick_rate(0), Duration::from_secs(1));
        assert_eq!(tick_rate(5_000), MIN_TICK);
        assert_eq!(tick_rate(u64::MAX), MIN_TICK);
    }

    #[test]
    fn tokens_are_abbreviated() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(2_250_000), "2.2M");
        assert_eq!(format_cost(3.456), "$3.46");
    }

    #[test]
    fn model_names_are_shortened() {
        assert_eq!(model_display_name("claude-opus-4-5-20251101"), "Opus 4.5");
        assert_eq!(model_display_name("claude-sonnet-4-20250514"), "Sonnet 4");
        assert_eq!(model_display_name("claude-sonnet-4-5-20250929"), "Sonnet 4.5");
        assert_eq!(model_display_name("claude-3-5-haiku-20241022"), "Haiku 3.5");
        assert_eq!(model_display_name("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn project_name_is_last_path_segment() {
        assert_eq!(project_name("/home/me/work/dashboard"), "dashboard");
        assert_eq!(project_name("/home/me/work/dashboard/"), "dashboard");
        assert_eq!(project_name(""), "Unknown");
        assert_eq!(truncate_text("abcdef", 4), "abc…");
    }

    fn snapshot() -> DashboardSnapshot {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut today = UsageData::empty(now);
        today.total_cost_usd = 4.2;
        today.model_breakdown = vec![ModelUsage {
            model: "claude-sonnet-4-5-20250929".to_string(),
            tokens: TokenUsage {
                input_tokens: 1_200,
                output_tokens: 300,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            },
            cost_usd: 4.2,
        }];
        DashboardSnapshot {
            today,
            week: UsageData::empty(now),
            month: UsageData::empty(now),
            billing_windows: vec![BillingWindow {
                id: "w1".to_string(),
                start_time: now - ChronoDuration::hours(1),
                end_time: now + ChronoDuration::hours(4),
                total_tokens: 1_500,
                cost_usd: 4.2,
                remaining_minutes: 240,
                is_active: true,
            }],
            sessions: vec![SessionSummary {
                session_id: "s1".to_string(),
                project_path: "/work/dashboard".to_string(),
                start_time: now - ChronoDuration::hours(1),
                end_time: now,
                message_count: 12,
                total_cost_usd: 4.2,
                models: vec!["claude-sonnet-4-5-20250929".to_string()],
            }],
        }
    }

    fn render(state: &SyncState) -> String {
        let view = ViewState {
            plan: &PLANS[0],
            notice: None,
        };
        let mut terminal = Terminal::new(TestBackend::new(120, 40)).unwrap();
        terminal
            .draw(|frame| draw_ui(frame, "local", 5, state, &view))
            .unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn dashboard_shows_window_models_and_sessions() {
        let state = SyncState {
            snapshot: Some(Arc::new(snapshot())),
            is_loading: false,
            error: None,
            sequence: 1,
        };
        let screen = render(&state);
        assert!(screen.contains("4h 0m remaining"));
        assert!(screen.contains("1.5K / 19.0K tokens"));
        assert!(screen.contains("Sonnet 4.5"));
        assert!(screen.contains("dashboard"));
        assert!(!screen.contains("Error:"));
    }

    #[test]
    fn error_banner_sits_above_stale_data() {
        let state = SyncState {
            snapshot: Some(Arc::new(snapshot())),
            is_loading: false,
            error: Some("usage backend unreachable: connection refused".to_string()),
            sequence: 2,
        };
        let screen = render(&state);
        assert!(screen.contains("Error: usage backend unreachable"));
        assert!(screen.contains("Sonnet 4.5"));
    }

    #[test]
    fn empty_state_shows_loading() {
        let screen = render(&SyncState {
            is_loading: true,
            ..SyncState::default()
        });
        assert!(screen.contains("Loading..."));
    }
}
