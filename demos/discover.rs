use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use eiscp_avr::{
    discover, Command, ConnectCoordinator, DiscoveredDevice, DiscoveryOptions, EiscpConfig,
    StatePublisher, Zone, ZoneConfig, ZoneIdentity,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const INPUTS: [&str; 7] = ["dvd", "video2", "cd", "fm", "net", "bluetooth", "usb"];

type Update = (String, Map<String, Value>);

/// Forwards published zone attributes to the UI
struct ChannelPublisher(mpsc::UnboundedSender<Update>);

impl StatePublisher for ChannelPublisher {
    fn publish(&self, entity_id: &str, attributes: Map<String, Value>) {
        let _ = self.0.send((entity_id.to_string(), attributes));
    }
}

#[derive(PartialEq)]
enum AppState {
    Discovery,
    ZoneControl,
}

struct App {
    state: AppState,
    devices: Vec<DiscoveredDevice>,
    discovery: DiscoveryOptions,
    discovery_rx: Option<oneshot::Receiver<eiscp_avr::Result<Vec<DiscoveredDevice>>>>,
    selected_device_index: usize,
    coordinator: ConnectCoordinator,
    update_receiver: mpsc::UnboundedReceiver<Update>,
    zones: Vec<ZoneConfig>,
    selected_zone_index: usize,
    attributes: BTreeMap<String, Map<String, Value>>,
    status_message: String,
    json_scroll: usize,
}

impl App {
    fn new(config: EiscpConfig) -> Self {
        let (update_tx, update_receiver) = mpsc::unbounded_channel();
        let publisher = Arc::new(ChannelPublisher(update_tx));
        let coordinator = ConnectCoordinator::new(&config.reconnect, publisher);

        Self {
            state: AppState::Discovery,
            devices: Vec::new(),
            discovery: config.discovery,
            discovery_rx: None,
            selected_device_index: 0,
            coordinator,
            update_receiver,
            zones: Vec::new(),
            selected_zone_index: 0,
            attributes: BTreeMap::new(),
            status_message: "Discovering receivers...".to_string(),
            json_scroll: 0,
        }
    }

    fn start_discovery(&mut self) {
        let (tx, rx) = oneshot::channel();
        let options = self.discovery.clone();
        tokio::spawn(async move {
            let _ = tx.send(discover(&options).await);
        });
        self.discovery_rx = Some(rx);
        self.status_message = "Discovering receivers...".to_string();
    }

    fn poll_discovery(&mut self) {
        let Some(rx) = &mut self.discovery_rx else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(devices)) => {
                self.status_message = format!(
                    "Found {} receiver(s). Press Enter to connect, r to search again.",
                    devices.len()
                );
                self.devices = devices;
                self.selected_device_index = 0;
                self.discovery_rx = None;
            }
            Ok(Err(e)) => {
                self.status_message = format!("Discovery failed: {}", e);
                self.discovery_rx = None;
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => self.discovery_rx = None,
        }
    }

    fn select_next(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device_index = (self.selected_device_index + 1) % self.devices.len();
        }
    }

    fn select_previous(&mut self) {
        let count = self.devices.len();
        if count > 0 {
            self.selected_device_index = (self.selected_device_index + count - 1) % count;
        }
    }

    async fn connect_to_selected_device(&mut self) {
        let Some(device) = self.devices.get(self.selected_device_index) else {
            self.status_message = "No receiver to connect to".to_string();
            return;
        };

        self.zones = [Zone::Main, Zone::Zone2]
            .into_iter()
            .map(|zone| {
                let mut config = ZoneConfig::new(device.model.clone(), device.host.clone(), zone);
                config.port = device.port;
                config
            })
            .collect();
        self.selected_zone_index = 0;
        self.status_message = format!("Connecting to {}...", device.model);

        if self.coordinator.connect(&self.zones).await {
            self.state = AppState::ZoneControl;
            self.status_message =
                "+/- volume, m mute, p power, i input, z zone, Esc back, q quit".to_string();
        } else {
            self.status_message = "No zone could be bound".to_string();
        }
    }

    fn current_zone(&self) -> Option<ZoneIdentity> {
        self.zones
            .get(self.selected_zone_index)
            .map(ZoneConfig::zone_identity)
    }

    async fn send(&mut self, command: Command, label: String) {
        let Some(id) = self.current_zone() else {
            self.status_message = "No zone selected".to_string();
            return;
        };
        match self.coordinator.send_command(&id, command).await {
            Ok(()) => self.status_message = label,
            Err(e) => self.status_message = format!("Failed: {}", e),
        }
    }

    async fn adjust_volume(&mut self, up: bool) {
        let (args, label) = if up {
            ("level-up", "Volume up")
        } else {
            ("level-down", "Volume down")
        };
        self.send(Command::new("volume", args), label.to_string()).await;
    }

    async fn toggle_mute(&mut self) {
        let Some(id) = self.current_zone() else {
            return;
        };
        let muting = id.zone.commands().muting;
        self.send(Command::new(muting, "toggle"), "Mute toggled".to_string())
            .await;
    }

    async fn toggle_power(&mut self) {
        let Some(id) = self.current_zone() else {
            return;
        };
        let on = self.coordinator.state(&id).power_state == "on";
        let target = if on { "standby" } else { "on" };
        let power = id.zone.commands().power;
        self.send(Command::new(power, target), format!("Power: {}", target))
            .await;
    }

    async fn cycle_input(&mut self) {
        let Some(id) = self.current_zone() else {
            return;
        };
        let current = self.coordinator.state(&id).source;
        let next = INPUTS
            .iter()
            .position(|input| *input == current)
            .map_or(0, |idx| (idx + 1) % INPUTS.len());
        let selector = id.zone.commands().selector;
        self.send(
            Command::new(selector, INPUTS[next]),
            format!("Input: {}", INPUTS[next]),
        )
        .await;
    }

    fn next_zone(&mut self) {
        if !self.zones.is_empty() {
            self.selected_zone_index = (self.selected_zone_index + 1) % self.zones.len();
            self.json_scroll = 0;
        }
    }

    fn handle_state_updates(&mut self) {
        while let Ok((entity_id, attributes)) = self.update_receiver.try_recv() {
            self.attributes.entry(entity_id).or_default().extend(attributes);
        }
    }

    fn go_back(&mut self) {
        self.coordinator.disconnect();
        self.state = AppState::Discovery;
        self.zones.clear();
        self.attributes.clear();
        self.json_scroll = 0;
        self.status_message = format!(
            "Found {} receiver(s). Press Enter to connect, r to search again.",
            self.devices.len()
        );
    }

    fn current_attributes(&self) -> Option<&Map<String, Value>> {
        let config = self.zones.get(self.selected_zone_index)?;
        self.attributes.get(&config.entity_id())
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    match app.state {
        AppState::Discovery => render_discovery(f, app, outer_chunks[0]),
        AppState::ZoneControl => {
            let inner_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(outer_chunks[0]);

            render_zone_control(f, app, inner_chunks[0]);
            render_json_dump(f, app, inner_chunks[1]);
        }
    }

    render_status(f, app, outer_chunks[1]);
}

fn render_discovery(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Receivers (j/k to select, Enter to connect, r to rescan, q to quit) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    if app.devices.is_empty() {
        let text = Paragraph::new("Waiting for eISCP receivers on the network...")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    }

    let label = Style::default().fg(Color::Yellow);
    let items: Vec<ListItem> = app
        .devices
        .iter()
        .map(|device| {
            ListItem::new(vec![
                Line::from(vec![Span::styled("Model: ", label), Span::raw(device.model.as_str())]),
                Line::from(vec![
                    Span::styled("Address: ", label),
                    Span::raw(format!("{}:{}", device.host, device.port)),
                ]),
                Line::from(vec![
                    Span::styled("Area / MAC: ", label),
                    Span::raw(format!("{} / {}", device.area_code, device.mac)),
                ]),
                Line::from(""),
            ])
        })
        .collect();

    let mut state = ListState::default();
    state.select(Some(app.selected_device_index));

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn render_zone_control(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Zone Control ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let Some(id) = app.current_zone() else {
        f.render_widget(Paragraph::new("No zone bound").block(block), area);
        return;
    };

    let state = app.coordinator.state(&id);
    let connected = app.coordinator.manager().is_connected(&id.physical());
    let label = Style::default().fg(Color::Yellow);
    let value = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);

    let mut lines = vec![
        Line::from(vec![
            Span::styled("Receiver: ", label.add_modifier(Modifier::BOLD)),
            Span::raw(format!("{}@{}", id.model, id.host)),
        ]),
        Line::from(vec![
            Span::styled("Link: ", label),
            if connected {
                Span::styled("connected", Style::default().fg(Color::Green))
            } else {
                Span::styled(
                    "reconnecting",
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )
            },
        ]),
        Line::from(""),
    ];

    for (index, zone) in app.zones.iter().enumerate() {
        let active = index == app.selected_zone_index;
        let prefix = if active { "  ▶ " } else { "    " };
        lines.push(Line::from(vec![
            Span::raw(prefix),
            Span::styled(
                zone.zone.to_string(),
                if active {
                    Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                },
            ),
        ]));
    }
    lines.push(Line::from(""));

    for (name, field) in [
        ("Power: ", &state.power_state),
        ("Source: ", &state.source),
        ("Sub-source: ", &state.sub_source),
        ("Audio format: ", &state.audio_format),
    ] {
        lines.push(Line::from(vec![
            Span::styled(name, label),
            Span::styled(field.as_str(), value),
        ]));
    }

    if let Some(attributes) = app.current_attributes() {
        if let Some(volume) = attributes.get("volume") {
            lines.push(Line::from(vec![
                Span::styled("Volume: ", label),
                Span::styled(volume.to_string(), value),
            ]));
        }
    }

    let text = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    f.render_widget(text, area);
}

fn render_json_dump(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Published attributes (j/k scroll) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let Some(attributes) = app.current_attributes() else {
        let text = Paragraph::new("Nothing reported yet")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    };

    let json_str = match serde_json::to_string_pretty(attributes) {
        Ok(json) => json,
        Err(e) => format!("Error serializing JSON: {}", e),
    };
    let lines: Vec<Line> = json_str.lines().map(|line| Line::from(line.to_string())).collect();

    let text = Paragraph::new(lines)
        .block(block)
        .scroll((app.json_scroll as u16, 0));
    f.render_widget(text, area);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to a file so they don't tear the terminal
    if let Ok(path) = std::env::var("EISCP_LOG") {
        let file = std::fs::File::create(path)?;
        tracing_subscriber::fmt()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(load_config()?);
    app.start_discovery();

    let res = run_app(&mut terminal, &mut app).await;

    app.coordinator.disconnect();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

/// Settings from the JSON file named by `EISCP_CONFIG`, if any
fn load_config() -> Result<EiscpConfig, Box<dyn std::error::Error>> {
    match std::env::var("EISCP_CONFIG") {
        Ok(path) => Ok(EiscpConfig::from_json(&std::fs::read_to_string(path)?)?),
        Err(_) => {
            let mut config = EiscpConfig::default();
            config.discovery.devices = 8;
            config.discovery.timeout_secs = 3;
            Ok(config)
        }
    }
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        app.poll_discovery();
        app.handle_state_updates();

        terminal.draw(|f| ui(f, app))?;

        if !event::poll(std::time::Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match app.state {
            AppState::Discovery => match key.code {
                KeyCode::Char('q') => return Ok(()),
                KeyCode::Char('j') | KeyCode::Down => app.select_next(),
                KeyCode::Char('k') | KeyCode::Up => app.select_previous(),
                KeyCode::Char('r') => app.start_discovery(),
                KeyCode::Enter => app.connect_to_selected_device().await,
                _ => {}
            },
            AppState::ZoneControl => match key.code {
                KeyCode::Char('q') => return Ok(()),
                KeyCode::Esc => app.go_back(),
                KeyCode::Char('+') | KeyCode::Char('=') => app.adjust_volume(true).await,
                KeyCode::Char('-') | KeyCode::Char('_') => app.adjust_volume(false).await,
                KeyCode::Char('m') => app.toggle_mute().await,
                KeyCode::Char('p') => app.toggle_power().await,
                KeyCode::Char('i') => app.cycle_input().await,
                KeyCode::Char('z') => app.next_zone(),
                KeyCode::Char('j') => app.json_scroll += 1,
                KeyCode::Char('k') => app.json_scroll = app.json_scroll.saturating_sub(1),
                _ => {}
            },
        }
    }
}
