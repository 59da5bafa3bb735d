//! Serial monitor command implementation.
//!
//! Single-threaded: the port's event channel tells the loop when to read, and
//! keyboard input (crossterm raw mode) is polled between events.

use {
    crate::{
        Cli, clear_interrupted_flag,
        display::{TextRenderer, hex_rows},
        serial::{prepare_port, write_all},
        was_interrupted,
    },
    anyhow::{Context, Result, bail},
    console::style,
    crossterm::{
        event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
        terminal,
    },
    std::{
        fs::{File, OpenOptions},
        io::{self, IsTerminal, Write as _},
        path::Path,
        sync::mpsc::{Receiver, RecvTimeoutError},
        time::Duration,
    },
    zbserial::{PortEvent, SerialPort},
};

/// Keyboard poll interval; also bounds event latency while interactive.
const KEY_POLL: Duration = Duration::from_millis(20);

/// Event wait when there is no keyboard to poll.
const EVENT_WAIT: Duration = Duration::from_millis(100);

/// What the user toggles while the monitor runs.
#[derive(Debug)]
struct MonitorView {
    text: TextRenderer,
    hex: bool,
    timestamps: bool,
    raw_mode: bool,
}

impl MonitorView {
    fn status(&mut self, message: &str) {
        let lead = self.text.break_line();
        if self.raw_mode {
            eprint!("{lead}\r\x1b[2K{message}\r\n");
        } else {
            eprint!("{lead}");
            eprintln!("{message}");
        }
        io::stderr().flush().ok();
    }

    fn show(&mut self, bytes: &[u8]) {
        let rendered = if self.hex {
            let lead = self.text.break_line();
            format!("{lead}{}", hex_rows(bytes, self.timestamps))
        } else {
            self.text.render(bytes, self.timestamps)
        };
        print!("{rendered}");
        io::stdout().flush().ok();
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Read everything pending and show it.
fn pump(port: &mut SerialPort, view: &mut MonitorView, log: &mut Option<File>) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let n = port
            .read(&mut buf)
            .with_context(|| format!("Read from {} failed", port.identifier()))?;
        if n == 0 {
            return Ok(());
        }

        let data = &buf[..n];
        if let Some(file) = log {
            file.write_all(data)
                .context("Failed to write log file")?;
        }
        view.show(data);

        if n < buf.len() {
            return Ok(());
        }
    }
}

fn handle_event(
    event: PortEvent,
    port: &mut SerialPort,
    view: &mut MonitorView,
    log: &mut Option<File>,
) -> Result<()> {
    match event {
        PortEvent::DataAvailable => pump(port, view, log),
        PortEvent::Error => bail!("Port {} reported an error", port.identifier()),
        PortEvent::Closed => bail!("Port {} was closed", port.identifier()),
        PortEvent::Opened => Ok(()),
    }
}

/// Bytes to transmit for a key press, if it maps to any.
fn key_bytes(code: KeyCode, modifiers: KeyModifiers) -> Option<Vec<u8>> {
    match (code, modifiers) {
        (KeyCode::Enter, _) => Some(b"\r\n".to_vec()),
        (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
            let mut buf = [0u8; 4];
            Some(
                c.encode_utf8(&mut buf)
                    .as_bytes()
                    .to_vec(),
            )
        },
        (KeyCode::Backspace, _) => Some(vec![0x08]),
        (KeyCode::Tab, _) => Some(vec![0x09]),
        (KeyCode::Esc, _) => Some(vec![0x1B]),
        _ => None,
    }
}

/// Handle one key press. Returns `false` when the user asked to exit.
fn handle_key(key: KeyEvent, port: &mut SerialPort, view: &mut MonitorView) -> Result<bool> {
    if key.kind != KeyEventKind::Press {
        return Ok(true);
    }

    match (key.code, key.modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => return Ok(false),
        (KeyCode::Char('t'), KeyModifiers::CONTROL) => {
            view.timestamps = !view.timestamps;
            let state = if view.timestamps { "on" } else { "off" };
            view.status(&format!("{} Timestamps {state}", style("⏱").cyan()));
        },
        (KeyCode::Char('x'), KeyModifiers::CONTROL) => {
            view.hex = !view.hex;
            let mode = if view.hex { "hex" } else { "text" };
            view.status(&format!("{} Display mode: {mode}", style("⇄").cyan()));
        },
        (code, modifiers) => {
            if let Some(bytes) = key_bytes(code, modifiers) {
                write_all(port, &bytes)?;
            }
        },
    }
    Ok(true)
}

fn run_interactive(
    port: &mut SerialPort,
    events: &Receiver<PortEvent>,
    view: &mut MonitorView,
    log: &mut Option<File>,
) -> Result<()> {
    loop {
        if was_interrupted() {
            return Ok(());
        }

        for pending in events.try_iter() {
            handle_event(pending, port, view, log)?;
        }

        if event::poll(KEY_POLL)? {
            if let Event::Key(key) = event::read()? {
                if !handle_key(key, port, view)? {
                    return Ok(());
                }
            }
        }
    }
}

fn run_streaming(
    port: &mut SerialPort,
    events: &Receiver<PortEvent>,
    view: &mut MonitorView,
    log: &mut Option<File>,
) -> Result<()> {
    loop {
        if was_interrupted() {
            return Ok(());
        }

        match events.recv_timeout(EVENT_WAIT) {
            Ok(pending) => handle_event(pending, port, view, log)?,
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Run the serial monitor.
///
/// - Serial → terminal: on every data-available notification
/// - Keyboard → serial: when stdin is a terminal
/// - Ctrl+C: exit
/// - Ctrl+T: toggle timestamp display
/// - Ctrl+X: toggle hex display
pub(crate) fn cmd_monitor(
    cli: &Cli,
    hex: bool,
    timestamps: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    let mut log = log_file.map(open_log).transpose()?;

    let mut port = prepare_port(cli)?;
    let events = port.events();

    eprintln!(
        "{} Opening {} at {}",
        style("📡").cyan(),
        style(port.identifier()).green(),
        port.settings()
    );
    port.open()
        .with_context(|| format!("Failed to open {}", port.identifier()))?;

    if let Some(path) = log_file {
        eprintln!("{} Logging to {}", style("📝").cyan(), path.display());
    }

    let interactive = io::stdin().is_terminal();
    let mut view = MonitorView {
        text: TextRenderer::default(),
        hex,
        timestamps,
        raw_mode: false,
    };

    let outcome = if interactive {
        eprintln!(
            "{}",
            style("Ctrl+C exit · Ctrl+T timestamps · Ctrl+X hex/text").dim()
        );
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        let _raw_guard = RawModeGuard;
        view.raw_mode = true;
        run_interactive(&mut port, &events, &mut view, &mut log)
    } else {
        run_streaming(&mut port, &events, &mut view, &mut log)
    };
    view.raw_mode = false;

    if let Err(e) = port.close() {
        log::warn!("Closing {} failed: {e}", port.identifier());
    }
    view.status(&format!("{} Monitor closed", style("👋").cyan()));
    clear_interrupted_flag();
    outcome
}
