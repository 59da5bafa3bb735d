//! zbterm - Terminal for ZigBee radios on a serial link.
//!
//! ## Features
//!
//! - List serial ports in natural order
//! - Interactive monitor with text or hex display
//! - One-shot hex frame transmission with reply capture
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{CommandFactory, Parser, Subcommand},
    clap_complete::{Shell, generate},
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        io,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    zbserial::{FlowControl, Parity, discover_ports},
};

mod commands;
mod display;
mod serial;

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C was received since the flag was last cleared.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user backed out (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

/// zbterm - A terminal for ZigBee radios on a serial link.
///
/// Environment variables:
///   ZBTERM_PORT              - Default serial port
///   ZBTERM_BAUD              - Default baud rate (default: 19200)
///   ZBTERM_DATA_BITS         - Data bits, 5-8 (default: 8)
///   ZBTERM_PARITY            - Parity: none, odd, even (default: none)
///   ZBTERM_FLOW              - Flow control: none, hardware, xonxoff (default: none)
///   ZBTERM_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "zbterm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ZBTERM_PORT")]
    pub port: Option<String>,

    /// Baud rate. Unsupported rates fall back to 19200.
    #[arg(
        short,
        long,
        global = true,
        default_value = "19200",
        env = "ZBTERM_BAUD"
    )]
    pub baud: u32,

    /// Data bits per character.
    #[arg(
        long,
        global = true,
        default_value = "8",
        env = "ZBTERM_DATA_BITS",
        value_parser = clap::value_parser!(u8).range(5..=8)
    )]
    pub data_bits: u8,

    /// Parity (none, odd, even).
    #[arg(long, global = true, default_value = "none", env = "ZBTERM_PARITY")]
    pub parity: Parity,

    /// Flow control (none, hardware, xonxoff).
    #[arg(long, global = true, default_value = "none", env = "ZBTERM_FLOW")]
    pub flow: FlowControl,

    /// Trace every transferred byte in hex.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ZBTERM_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Open a port and show what arrives; typed keys are sent.
    Monitor {
        /// Show received bytes as hex rows.
        #[arg(long)]
        hex: bool,

        /// Prefix lines with the time of arrival.
        #[arg(long)]
        timestamp: bool,

        /// Append received bytes to a file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Send hex bytes and print the reply.
    Send {
        /// Bytes to send, e.g. "01 02 03", 010203 or 0x01,0x02.
        #[arg(value_name = "HEX", required = true, num_args = 1..)]
        data: Vec<String>,

        /// How long to collect a reply, in milliseconds.
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn main() -> ExitCode {
    if std::env::var_os("NO_COLOR").is_some() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "zbterm v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Cannot install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Monitor {
            hex,
            timestamp,
            log_file,
        } => commands::monitor::cmd_monitor(cli, *hex, *timestamp, log_file.as_deref()),
        Commands::Send { data, wait_ms } => commands::send::cmd_send(cli, data, *wait_ms),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = discover_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), style(port).cyan());
        }
    }
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
