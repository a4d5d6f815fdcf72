use crate::cli::{build_config, Cli};
use crate::engine::Monitor;
use crate::model::{CycleOutcome, MonitorEvent, RunState, StartError, Statistics};
use crate::stats::parse_filter_threshold;
use anyhow::{Context, Result};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    symbols,
    text::Line,
    widgets::{Axis, Bar, BarChart, BarGroup, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;

/// Width of one histogram bucket in milliseconds.
const BIN_SIZE_MS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Host,
    Filter,
}

struct UiState {
    host_input: String,
    filter_input: String,
    focus: Option<Focus>,
    run_state: RunState,
    info: String,
    stats: Option<Statistics>,
    /// Successful round trips of the current history, for the histogram.
    latencies: Vec<u64>,
    /// (seconds since launch, rtt ms) for the time chart; the x coordinate
    /// comes from each sample's own probe timestamp.
    points: Vec<(f64, f64)>,
    run_start: Instant,
    /// A start request is in flight (probing).
    starting: bool,
}

impl UiState {
    fn new() -> Self {
        Self {
            host_input: String::new(),
            filter_input: String::new(),
            focus: None,
            run_state: RunState::Idle,
            info: "h edit host, s start, q quit".into(),
            stats: None,
            latencies: Vec::new(),
            points: Vec::new(),
            run_start: Instant::now(),
            starting: false,
        }
    }

    fn push_point(&mut self, at: Instant, rtt_ms: u64) {
        const MAX: usize = 3600; // an hour at the default interval
        let t = at.saturating_duration_since(self.run_start).as_secs_f64();
        self.points.push((t, rtt_ms as f64));
        if self.points.len() > MAX {
            let _ = self.points.drain(0..(self.points.len() - MAX));
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let (monitor, mut monitor_events) = Monitor::spawn(build_config(&args));
    let (start_res_tx, mut start_res_rx) = mpsc::channel::<Result<(), StartError>>(4);

    let mut state = UiState::new();
    if args.filter > 0 {
        state.filter_input = args.filter.to_string();
    }
    if let Some(host) = args.host.as_deref() {
        state.host_input = host.to_string();
        request_start(&mut state, &monitor, &start_res_tx);
    }

    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    let res = loop {
        tokio::select! {
            _ = tick.tick() => {
                terminal.draw(|f| draw(f.area(), f, &state)).ok();
            }
            maybe_ev = events.next() => {
                let Some(Ok(ev)) = maybe_ev else { continue };
                let Event::Key(k) = ev else { continue };
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
                    monitor.stop().await;
                    break Ok(());
                }
                match state.focus {
                    Some(focus) => match k.code {
                        KeyCode::Esc => state.focus = None,
                        KeyCode::Tab => {
                            state.focus = Some(match focus {
                                Focus::Host => Focus::Filter,
                                Focus::Filter => Focus::Host,
                            });
                        }
                        KeyCode::Enter => {
                            if focus == Focus::Host {
                                request_start(&mut state, &monitor, &start_res_tx);
                            }
                            state.focus = None;
                        }
                        KeyCode::Backspace => {
                            match focus {
                                Focus::Host => {
                                    state.host_input.pop();
                                }
                                Focus::Filter => {
                                    state.filter_input.pop();
                                    // Applied on every edit, unparsable means
                                    // "no filter".
                                    monitor.set_filter_threshold(&state.filter_input);
                                }
                            }
                        }
                        KeyCode::Char(c) => match focus {
                            Focus::Host => state.host_input.push(c),
                            Focus::Filter => {
                                state.filter_input.push(c);
                                monitor.set_filter_threshold(&state.filter_input);
                            }
                        },
                        _ => {}
                    },
                    None => match k.code {
                        KeyCode::Char('q') => {
                            monitor.stop().await;
                            break Ok(());
                        }
                        KeyCode::Char('s') | KeyCode::Enter => {
                            request_start(&mut state, &monitor, &start_res_tx);
                        }
                        KeyCode::Char('x') => {
                            monitor.stop().await;
                        }
                        KeyCode::Char('r') => {
                            monitor.reset().await;
                        }
                        KeyCode::Char('h') | KeyCode::Tab => state.focus = Some(Focus::Host),
                        KeyCode::Char('f') => state.focus = Some(Focus::Filter),
                        _ => {}
                    },
                }
            }
            maybe_res = start_res_rx.recv() => {
                if let Some(res) = maybe_res {
                    state.starting = false;
                    if let Err(e) = res {
                        state.info = format!("Start failed: {e}");
                    }
                }
            }
            maybe_ev = monitor_events.recv() => {
                match maybe_ev {
                    Some(ev) => apply_event(&mut state, ev),
                    None => break Ok(()),
                }
            }
        }
    };

    // Restore terminal.
    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn request_start(state: &mut UiState, monitor: &Monitor, res_tx: &mpsc::Sender<Result<(), StartError>>) {
    if state.starting {
        return;
    }
    let host = state.host_input.trim().to_string();
    if host.is_empty() {
        state.info = "Enter a host first (h)".into();
        return;
    }
    state.starting = true;
    let monitor = monitor.clone();
    let res_tx = res_tx.clone();
    tokio::spawn(async move {
        res_tx.send(monitor.start(&host).await).await.ok();
    });
}

fn apply_event(state: &mut UiState, ev: MonitorEvent) {
    match ev {
        MonitorEvent::StateChanged(s) => {
            state.run_state = s;
            state.info = s.label().into();
        }
        MonitorEvent::CycleCompleted { outcome, at, stats } => {
            if let CycleOutcome::Reply { rtt_ms } = outcome {
                state.latencies.push(rtt_ms);
                state.push_point(at, rtt_ms);
            }
            state.stats = stats;
        }
        MonitorEvent::HistoryCleared => {
            state.latencies.clear();
            state.points.clear();
            state.stats = None;
        }
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // host + filter inputs
                Constraint::Min(8),    // histogram + time chart
                Constraint::Length(3), // status line
                Constraint::Length(1), // shortcuts
            ]
            .as_ref(),
        )
        .split(area);

    draw_inputs(chunks[0], f, state);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
        .split(chunks[1]);
    draw_histogram(middle[0], f, state);
    draw_time_chart(middle[1], f, state);

    let status = Paragraph::new(status_line(state)).block(
        Block::default()
            .borders(Borders::ALL)
            .title("pingmon"),
    );
    f.render_widget(status, chunks[2]);

    let hints = Paragraph::new("s start  x stop  r reset  h host  f filter  q quit")
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(hints, chunks[3]);
}

fn draw_inputs(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let row = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)].as_ref())
        .split(area);

    let input_style = |focused: bool| {
        if focused {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        }
    };

    let host = Paragraph::new(state.host_input.as_str()).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Host")
            .border_style(input_style(state.focus == Some(Focus::Host))),
    );
    f.render_widget(host, row[0]);

    let filter = Paragraph::new(state.filter_input.as_str()).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Filter (ms)")
            .border_style(input_style(state.focus == Some(Focus::Filter))),
    );
    f.render_widget(filter, row[1]);
}

fn draw_histogram(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let threshold = parse_filter_threshold(&state.filter_input);
    let bars = histogram_bars(&state.latencies, threshold, area.width);
    if bars.is_empty() {
        let empty = Paragraph::new("Waiting for samples...").block(
            Block::default().borders(Borders::ALL).title("Ping (ms)"),
        );
        f.render_widget(empty, area);
        return;
    }

    let chart = BarChart::default()
        .block(Block::default().borders(Borders::ALL).title("Ping (ms)"))
        .data(BarGroup::default().bars(&bars))
        .bar_width(5)
        .bar_gap(1)
        .bar_style(Style::default().fg(Color::Green));
    f.render_widget(chart, area);
}

/// Bin the latencies that pass the filter into fixed-width buckets. Only as
/// many buckets as fit the widget are returned, starting at the lowest
/// occupied one.
fn histogram_bars(latencies: &[u64], threshold: u64, width: u16) -> Vec<Bar<'static>> {
    let filtered: Vec<u64> = latencies
        .iter()
        .copied()
        .filter(|&v| v >= threshold)
        .collect();
    if filtered.is_empty() {
        return Vec::new();
    }

    let Ok(mut hist) = hdrhistogram::Histogram::<u64>::new_with_bounds(1, 60_000, 3) else {
        return Vec::new();
    };
    for &ms in &filtered {
        let _ = hist.record(ms.clamp(1, 60_000));
    }

    let max_bars = (width as usize / 6).max(1);
    let mut bars = Vec::new();
    let mut before_first_occupied = true;
    for bucket in hist.iter_linear(BIN_SIZE_MS) {
        let count = bucket.count_since_last_iteration();
        if count == 0 && before_first_occupied {
            continue;
        }
        before_first_occupied = false;
        let low = bucket.value_iterated_to().saturating_sub(BIN_SIZE_MS - 1);
        bars.push(
            Bar::default()
                .value(count)
                .label(Line::from(format!("{low}"))),
        );
        if bars.len() >= max_bars {
            break;
        }
    }
    bars
}

fn draw_time_chart(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if state.points.is_empty() {
        let empty = Paragraph::new("Waiting for samples...").block(
            Block::default().borders(Borders::ALL).title("Latency over time"),
        );
        f.render_widget(empty, area);
        return;
    }

    let x_min = state.points.first().map(|(x, _)| *x).unwrap_or(0.0);
    let x_max = state.points.last().map(|(x, _)| *x).unwrap_or(0.0);
    let y_max = state
        .points
        .iter()
        .map(|(_, y)| *y)
        .fold(10.0_f64, f64::max)
        * 1.10;

    let ds = Dataset::default()
        .graph_type(GraphType::Line)
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Cyan))
        .data(&state.points);
    let chart = Chart::new(vec![ds])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Latency over time"),
        )
        .x_axis(Axis::default().bounds([x_min, x_max.max(1.0)]))
        .y_axis(Axis::default().title("ms").bounds([0.0, y_max]));
    f.render_widget(chart, area);
}

/// The single human-readable status line: run state, then the full summary,
/// then the filtered subset when a threshold is active. Averages are floored
/// for display.
fn status_line(state: &UiState) -> String {
    let mut line = String::from(state.run_state.label());
    if state.starting {
        line.push_str(" ...");
    }
    if let Some(stats) = state.stats.as_ref() {
        let s = &stats.summary;
        line.push_str(&format!(
            "   |   Total: {} | Avg: {} | Min: {} | Max: {} | Median: {} | Lost: {}",
            s.count,
            s.average.floor(),
            s.min,
            s.max,
            s.median,
            stats.lost
        ));
        if let Some(fs) = stats.filtered.as_ref() {
            line.push_str(&format!(
                "   |   Filtered: {} | Avg: {} | Min: {} | Max: {} | Median: {}",
                fs.count,
                fs.average.floor(),
                fs.min,
                fs.max,
                fs.median
            ));
        }
    } else if !state.info.is_empty() {
        line.push_str("   |   ");
        line.push_str(&state.info);
    }
    line
}
