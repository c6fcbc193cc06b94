mod cache;
mod config;
mod nav;
mod preview;
mod probe;
mod resolver;

use std::{
    env, fs,
    io::{self, stdout},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{UnboundedReceiver, error::TryRecvError},
};

use cache::{NodeState, TreeRow};
use config::{Config, load_config};
use nav::{NavEvent, Navigator};
use preview::PreviewPane;
use probe::{EntryKind, FsDispatcher, FsEvent};
use resolver::{CompletionResult, Verdict};

fn main() -> Result<()> {
    init_logging();
    let mut terminal = init_terminal().context("failed to init terminal")?;
    let app_result = run_app(&mut terminal);
    cleanup_terminal(&mut terminal).context("failed to restore terminal")?;
    app_result
}

/// Log to a file so tracing output never corrupts the alternate screen.
/// Silent unless TREELINE_LOG names a destination.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let Ok(path) = env::var("TREELINE_LOG") else {
        return;
    };
    let Ok(file) = fs::File::create(&path) else {
        eprintln!("could not open log file {path}");
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false)
        .init();
    tracing::info!("treeline starting");
}

fn init_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen).context("switch to alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("spawn terminal backend")
}

fn cleanup_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode().context("disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).context("leave alternate screen")?;
    terminal.show_cursor().context("show cursor")
}

fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    let runtime = Runtime::new().context("start async runtime")?;
    let (fs_dispatcher, mut fs_rx) = FsDispatcher::new(&runtime);
    let config = load_config();
    let tick_rate = Duration::from_millis(config.tick_ms);
    let root = match env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => env::current_dir().context("read current dir")?,
    };
    let root = fs::canonicalize(&root)
        .with_context(|| format!("resolving start directory {}", root.display()))?;
    let mut app = App::new(fs_dispatcher, config, root);

    loop {
        app.drain_fs_events(&mut fs_rx);
        app.apply_nav_events();
        app.sync_rows();
        terminal
            .draw(|frame| render(frame, &app))
            .context("draw frame")?;
        if poll_and_handle_events(&mut app, tick_rate)? {
            break;
        }
    }
    Ok(())
}

fn poll_and_handle_events(app: &mut App, tick_rate: Duration) -> Result<bool> {
    if event::poll(tick_rate).context("poll for events")? {
        match event::read().context("read event")? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if handle_key_event(app, key) {
                    return Ok(true);
                }
            }
            _ => {}
        }
    }
    Ok(false)
}

fn handle_key_event(app: &mut App, key: KeyEvent) -> bool {
    if matches!(app.input_mode, InputMode::Goto { .. }) {
        handle_goto_mode(app, key)
    } else {
        handle_normal_mode(app, key)
    }
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Char('j') | KeyCode::Down => app.move_cursor(1),
        KeyCode::Char('k') | KeyCode::Up => app.move_cursor(-1),
        KeyCode::Char('h') | KeyCode::Left => app.collapse_or_parent(),
        KeyCode::Char('l') | KeyCode::Right | KeyCode::Enter => app.activate_cursor(),
        KeyCode::Char('g') => app.start_goto(),
        KeyCode::Char('p') => app.toggle_preview(),
        KeyCode::Char('a') => app.toggle_hidden(),
        KeyCode::Char('r') => app.refresh_cursor_dir(),
        _ => {}
    }
    false
}

fn handle_goto_mode(app: &mut App, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
            app.status = "Go to canceled".into();
        }
        KeyCode::Enter => app.submit_goto(),
        KeyCode::Tab => app.accept_completion(),
        KeyCode::Backspace => app.edit_goto(|buffer| {
            buffer.pop();
        }),
        KeyCode::Char(ch) if !ch.is_control() => app.edit_goto(|buffer| buffer.push(ch)),
        _ => {}
    }
    false
}

enum InputMode {
    Normal,
    Goto {
        buffer: String,
        result: Option<CompletionResult>,
    },
}

struct App {
    nav: Navigator,
    config: Config,
    input_mode: InputMode,
    rows: Vec<TreeRow>,
    cursor: usize,
    follow_selection: bool,
    show_preview: bool,
    preview: PreviewPane,
    preview_for: Option<PathBuf>,
    status: String,
}

impl App {
    const HELP_LINE: &'static str =
        "j/k move | h/l fold | g go to | p preview | a hidden | r reload | q quit";

    fn new(fs_dispatcher: FsDispatcher, config: Config, root: PathBuf) -> Self {
        let show_preview = config.preview;
        Self {
            nav: Navigator::new(fs_dispatcher, root),
            config,
            input_mode: InputMode::Normal,
            rows: Vec::new(),
            cursor: 0,
            follow_selection: true,
            show_preview,
            preview: PreviewPane::loading(),
            preview_for: None,
            status: String::new(),
        }
    }

    fn drain_fs_events(&mut self, rx: &mut UnboundedReceiver<FsEvent>) {
        loop {
            match rx.try_recv() {
                Ok(event) => self.nav.handle_fs_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.status = "Filesystem worker disconnected".into();
                    break;
                }
            }
        }
    }

    fn apply_nav_events(&mut self) {
        while let Some(event) = self.nav.next_event() {
            match event {
                NavEvent::SelectionChanged(_) => {
                    self.follow_selection = true;
                }
                NavEvent::NodeStateChanged { path, state, .. } => match state {
                    NodeState::Errored(err) => {
                        self.status = format!("Error: {err}");
                    }
                    NodeState::Loaded => {
                        self.status = format!("Loaded {}", path.display());
                    }
                    NodeState::Loading { .. } | NodeState::Unloaded => {}
                },
                NavEvent::CompletionUpdated(completion) => {
                    if let InputMode::Goto { buffer, result } = &mut self.input_mode {
                        // A result for anything but the current buffer is a
                        // leftover from a superseded keystroke.
                        if completion.query.raw == *buffer {
                            *result = Some(completion);
                        }
                    } else if completion.verdict == Verdict::Invalid {
                        if let Some(reason) = &completion.reason {
                            self.status = format!("Error: {reason}");
                        }
                    }
                }
            }
        }
    }

    /// Rebuild the flattened tree and keep cursor, selection and preview
    /// consistent with it.
    fn sync_rows(&mut self) {
        self.rows = self.nav.visible_rows(self.config.show_hidden);
        if self.follow_selection {
            if let Some(index) = self
                .rows
                .iter()
                .position(|row| row.path == self.nav.selection())
            {
                self.cursor = index;
            }
            self.follow_selection = false;
        }
        if self.cursor >= self.rows.len() {
            self.cursor = self.rows.len().saturating_sub(1);
        }
        self.update_preview();
    }

    fn move_cursor(&mut self, delta: isize) {
        if self.rows.is_empty() {
            return;
        }
        let len = self.rows.len() as isize;
        self.cursor = (self.cursor as isize + delta).rem_euclid(len) as usize;
        let path = self.rows[self.cursor].path.clone();
        self.nav.select(&path);
        self.follow_selection = false;
    }

    fn cursor_row(&self) -> Option<&TreeRow> {
        self.rows.get(self.cursor)
    }

    fn activate_cursor(&mut self) {
        let Some(row) = self.cursor_row().cloned() else {
            return;
        };
        if row.error.is_some() {
            self.status = format!("Retrying {}", row.path.display());
            self.nav.retry(&row.path);
        } else if row.entry.is_dir_like() {
            self.nav.toggle(&row.path);
        } else {
            self.status = format!("'{}' is not a directory", row.entry.name);
        }
    }

    fn collapse_or_parent(&mut self) {
        let Some(row) = self.cursor_row().cloned() else {
            return;
        };
        if row.expanded {
            self.nav.toggle(&row.path);
            return;
        }
        let Some(parent) = row.path.parent() else {
            return;
        };
        if let Some(index) = self.rows.iter().position(|r| r.path == parent) {
            self.cursor = index;
            let path = self.rows[index].path.clone();
            self.nav.select(&path);
        }
    }

    fn refresh_cursor_dir(&mut self) {
        let target = match self.cursor_row() {
            Some(row) if row.entry.is_dir_like() => row.path.clone(),
            Some(row) => row
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.nav.root().to_path_buf()),
            None => self.nav.root().to_path_buf(),
        };
        self.status = format!("Reloading {}", target.display());
        self.nav.refresh(&target);
    }

    fn toggle_preview(&mut self) {
        self.show_preview = !self.show_preview;
        self.preview_for = None;
    }

    fn toggle_hidden(&mut self) {
        self.config.show_hidden = !self.config.show_hidden;
        self.status = if self.config.show_hidden {
            "Showing hidden entries".into()
        } else {
            "Hiding hidden entries".into()
        };
    }

    fn start_goto(&mut self) {
        let mut buffer = self.nav.root().display().to_string();
        if !buffer.ends_with('/') {
            buffer.push('/');
        }
        self.nav.set_input(&buffer);
        self.input_mode = InputMode::Goto {
            buffer,
            result: None,
        };
        self.status = "Go to: type a path, Tab completes, Enter accepts".into();
    }

    fn edit_goto(&mut self, mutate: impl FnOnce(&mut String)) {
        let InputMode::Goto { buffer, result } = &mut self.input_mode else {
            return;
        };
        mutate(buffer);
        *result = None;
        let buffer = buffer.clone();
        self.nav.set_input(&buffer);
    }

    fn submit_goto(&mut self) {
        let InputMode::Goto { buffer, .. } = &self.input_mode else {
            return;
        };
        let target = buffer.clone();
        self.input_mode = InputMode::Normal;
        self.status = format!("Navigating to {target}");
        self.nav.navigate_to(&target);
    }

    /// Replace the trailing partial component with the offered ghost text.
    fn accept_completion(&mut self) {
        let InputMode::Goto { buffer, result } = &self.input_mode else {
            return;
        };
        let Some(completion) = result else { return };
        let Some(best) = &completion.best_match else {
            self.status = "Ambiguous: keep typing".into();
            return;
        };
        let prefix = &completion.query.existing_prefix;
        let target = prefix.join(best);
        // Echo the home shorthand back when that is what was typed.
        let mut accepted = if buffer.starts_with('~') {
            reabbreviate_home(&target)
        } else {
            target.display().to_string()
        };
        if self.nav.candidate_is_dir(prefix, best) && !accepted.ends_with('/') {
            accepted.push('/');
        }
        self.nav.set_input(&accepted);
        self.input_mode = InputMode::Goto {
            buffer: accepted,
            result: None,
        };
    }

    fn update_preview(&mut self) {
        if !self.show_preview {
            return;
        }
        let Some(row) = self.cursor_row().cloned() else {
            self.preview = PreviewPane::empty();
            self.preview_for = None;
            return;
        };
        if self.preview_for.as_deref() == Some(row.path.as_path()) {
            return;
        }
        if row.loading {
            self.preview = PreviewPane::loading();
            return;
        }
        self.preview_for = Some(row.path.clone());
        self.preview = preview::build(&self.nav, &row.path, row.entry.is_dir_like());
    }

    fn describe_cursor(&self) -> String {
        match self.cursor_row() {
            None => "No entries".into(),
            Some(row) => {
                let kind = match row.entry.kind {
                    EntryKind::Directory => "Directory",
                    EntryKind::File => "File",
                    EntryKind::Symlink => "Symlink",
                    EntryKind::Other => "Other",
                };
                let size = row
                    .entry
                    .size
                    .map(|s| format!("{s} bytes"))
                    .unwrap_or_else(|| "-".into());
                let modified = row
                    .entry
                    .modified
                    .and_then(|time| time.elapsed().ok())
                    .map(|elapsed| format!("{elapsed:?} ago"))
                    .unwrap_or_else(|| "unknown".into());
                format!(
                    "{kind}\nName: {}\nSize: {}\nModified: {}",
                    row.entry.name, size, modified
                )
            }
        }
    }

    fn footer_text(&self) -> String {
        if self.status.is_empty() {
            Self::HELP_LINE.into()
        } else {
            format!("{} | {}", self.status, Self::HELP_LINE)
        }
    }
}

fn render(frame: &mut Frame, app: &App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, layout[0], app);
    draw_body(frame, layout[1], app);
    draw_footer(frame, layout[2], app);
    draw_goto_overlay(frame, app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let title = Span::styled(
        "Treeline",
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );
    let path = Span::styled(
        app.nav.root().display().to_string(),
        Style::default().fg(Color::Cyan),
    );
    let line = Line::from(vec![title, Span::raw(" - "), path]);
    let widget = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("Root"));
    frame.render_widget(widget, area);
}

fn tree_row_line(row: &TreeRow) -> Line<'_> {
    let glyph = if row.error.is_some() {
        "!"
    } else if row.loading {
        "~"
    } else if row.entry.is_dir_like() {
        if row.expanded { "v" } else { ">" }
    } else {
        " "
    };
    let glyph_style = if row.error.is_some() {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::LightBlue)
    };
    let name_style = if row.entry.hidden {
        Style::default().add_modifier(Modifier::DIM)
    } else {
        Style::default()
    };
    Line::from(vec![
        Span::raw("  ".repeat(row.depth)),
        Span::styled(glyph, glyph_style),
        Span::raw(" "),
        Span::styled(row.entry.name.as_str(), name_style),
    ])
}

fn draw_body(frame: &mut Frame, area: Rect, app: &App) {
    let constraints = if app.show_preview {
        vec![Constraint::Percentage(50), Constraint::Percentage(50)]
    } else {
        vec![Constraint::Percentage(100)]
    };
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(constraints)
        .split(area);

    let items: Vec<ListItem> = app.rows.iter().map(|row| ListItem::new(tree_row_line(row))).collect();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Tree"))
        .highlight_style(
            Style::default()
                .fg(Color::Black)
                .bg(Color::LightGreen)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    if !app.rows.is_empty() {
        list_state.select(Some(app.cursor));
    }
    frame.render_stateful_widget(list, chunks[0], &mut list_state);

    if app.show_preview {
        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
            .split(chunks[1]);

        let detail = Paragraph::new(app.describe_cursor())
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Details"));
        frame.render_widget(detail, right[0]);

        let preview = Paragraph::new(app.preview.body.as_str())
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(app.preview.title.as_str()),
            );
        frame.render_widget(preview, right[1]);
    }
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let footer = Paragraph::new(app.footer_text())
        .style(Style::default().fg(Color::Gray))
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(footer, area);
}

fn draw_goto_overlay(frame: &mut Frame, app: &App) {
    let InputMode::Goto { buffer, result } = &app.input_mode else {
        return;
    };
    let area = overlay_area(frame.size());
    frame.render_widget(Clear, area);

    let input_style = match result.as_ref().map(|r| r.verdict) {
        Some(Verdict::Valid) => Style::default().fg(Color::Green),
        Some(Verdict::Invalid) => Style::default().fg(Color::Red),
        Some(Verdict::Pending) | None => Style::default().fg(Color::Yellow),
    };
    let mut spans = vec![
        Span::raw("> "),
        Span::styled(buffer.clone(), input_style.add_modifier(Modifier::BOLD)),
    ];
    if let Some(ghost) = ghost_suffix(result.as_ref()) {
        spans.push(Span::styled(
            ghost,
            Style::default().add_modifier(Modifier::DIM),
        ));
    }
    let lines = vec![
        Line::from(spans),
        Line::from(Span::raw(completion_hint(result.as_ref()))),
    ];

    let widget = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Go to"));
    frame.render_widget(widget, area);
}

/// The part of the best match that extends past what was typed.
fn ghost_suffix(result: Option<&CompletionResult>) -> Option<String> {
    let result = result?;
    let best = result.best_match.as_ref()?;
    let typed = result.query.remainder.chars().count();
    let suffix: String = best.chars().skip(typed).collect();
    (!suffix.is_empty()).then_some(suffix)
}

fn completion_hint(result: Option<&CompletionResult>) -> String {
    let Some(result) = result else {
        return String::new();
    };
    match result.verdict {
        Verdict::Pending => "...".into(),
        Verdict::Invalid => result
            .reason
            .as_ref()
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "Invalid path".into()),
        Verdict::Valid => {
            const SHOWN: usize = 8;
            if result.candidates.is_empty() {
                "Directory".into()
            } else {
                let mut hint = result.candidates[..result.candidates.len().min(SHOWN)].join("  ");
                if result.candidates.len() > SHOWN {
                    hint.push_str("  ...");
                }
                hint
            }
        }
    }
}

fn overlay_area(area: Rect) -> Rect {
    let height = 4u16;
    let width = area.width.saturating_sub(2);
    let x = area.x + 1;
    let y = area.y + area.height.saturating_sub(height + 1);
    Rect {
        x,
        y,
        width,
        height,
    }
}

/// Fold the home directory prefix back into `~` for display.
fn reabbreviate_home(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rest) = path.strip_prefix(&home) {
            return if rest.as_os_str().is_empty() {
                "~".to_string()
            } else {
                format!("~/{}", rest.display())
            };
        }
    }
    path.display().to_string()
}
