//! Serial port selection and setup.
//!
//! Port selection rules:
//! - `--port` (or `ZBTERM_PORT`) wins
//! - a single discovered port is used as is
//! - several ports prompt via dialoguer, or fail in non-interactive mode
//! - no ports is a usage error

use {
    crate::{Cli, CliError, was_interrupted},
    anyhow::{Context, Result},
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{info, warn},
    std::{io::IsTerminal, thread, time::Duration},
    zbserial::{DataBits, SerialPort, SerialSettings, discover_ports},
};

/// Pause after a write the driver could not accept.
const WRITE_BACKOFF: Duration = Duration::from_millis(2);

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub(crate) struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
}

impl From<&Cli> for SerialOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            port: cli.port.clone(),
            non_interactive: cli.non_interactive,
        }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Pick the port to talk to.
pub(crate) fn select_serial_port(options: &SerialOptions) -> Result<String> {
    if let Some(port) = &options.port {
        return Ok(port.clone());
    }
    choose_port(&discover_ports(), options.non_interactive)
}

fn choose_port(ports: &[String], non_interactive: bool) -> Result<String> {
    match ports {
        [] => Err(usage_err("No serial ports found; pass --port")),
        [only] => {
            info!("Auto-selected port: {only}");
            Ok(only.clone())
        },
        _ if non_interactive => Err(usage_err(
            "Multiple serial ports found; pass --port in non-interactive mode",
        )),
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Multiple serial ports found and no terminal to prompt on; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

fn select_port_interactive(ports: &[String]) -> Result<String> {
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(ports)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection.and_then(|index| ports.get(index)) {
        Some(port) => Ok(port.clone()),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Line settings requested on the command line.
pub(crate) fn settings_from(cli: &Cli) -> Result<SerialSettings> {
    let data_bits = DataBits::try_from(cli.data_bits)?;
    let settings = SerialSettings::new(cli.baud)
        .with_data_bits(data_bits)
        .with_parity(cli.parity)
        .with_flow_control(cli.flow);
    if settings.baud_rate != cli.baud {
        warn!(
            "Baud rate {} is not supported, using {}",
            cli.baud, settings.baud_rate
        );
    }
    Ok(settings)
}

/// Select and configure a port. The port is returned closed so callers can
/// subscribe before opening it.
pub(crate) fn prepare_port(cli: &Cli) -> Result<SerialPort> {
    let identifier = select_serial_port(&SerialOptions::from(cli))?;
    let mut port = SerialPort::with_settings(identifier, settings_from(cli)?);
    port.set_debug_logging(cli.debug);
    Ok(port)
}

/// Write all of `payload`, one `write()` call per chunk the driver accepts.
pub(crate) fn write_all(port: &mut SerialPort, payload: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < payload.len() {
        if was_interrupted() {
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        }
        let n = port
            .write(&payload[sent..])
            .with_context(|| format!("Write to {} failed", port.identifier()))?;
        if n == 0 {
            thread::sleep(WRITE_BACKOFF);
        }
        sent += n;
    }
    Ok(())
}
