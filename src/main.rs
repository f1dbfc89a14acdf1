//! ptyshell - line-oriented console over a PTY shell session
//!
//! Starts one shell behind a pseudoterminal and forwards each input line to
//! it. Shell output is printed as it arrives.
//!
//! # Quick Start
//!
//! ```text
//! ptyshell                   # First configured shell (default /bin/bash, /bin/sh)
//! ptyshell -s /bin/zsh       # Try zsh first
//! ptyshell --cols 132        # Override the initial width
//! ```
//!
//! # Console commands
//!
//! | Input | Action |
//! |-------|--------|
//! | (empty line) | Quit |
//! | exit, quit | Quit |
//! | resize COLS ROWS | Resize the PTY |
//! | anything else | Sent to the shell |

use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyshell::{strip_tag, Config, ConfigError, OutputCallback, ShellSession};

/// Environment variable overriding the configured log filter
const LOG_ENV: &str = "PTYSHELL_LOG";

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line options
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    /// Shell tried before the configured ones
    shell: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

fn print_version() {
    eprintln!("ptyshell {}", VERSION);
}

fn print_help() {
    eprintln!("ptyshell {} - interactive shell behind a pseudoterminal", VERSION);
    eprintln!();
    eprintln!("Usage: ptyshell [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <PATH>    Shell to try before the configured ones");
    eprintln!("  --cols <N>            Initial terminal width");
    eprintln!("  --rows <N>            Initial terminal height");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Console commands:");
    eprintln!("  resize <COLS> <ROWS>  Resize the terminal");
    eprintln!("  exit, quit            Leave (an empty line also leaves)");
    eprintln!("  <anything else>       Sent to the shell");
    eprintln!();
    eprintln!("Configuration: ~/.ptyshell/config.toml");
    eprintln!("Log file:      ~/.ptyshell/ptyshell.log ({} overrides the level)", LOG_ENV);
}

fn parse_size(flag: &str, value: Option<&String>) -> Result<u16, String> {
    let value = value.ok_or_else(|| format!("Missing value for {}", flag))?;
    match value.parse::<u16>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid value for {}: {}", flag, value)),
    }
}

/// Parse arguments, not including the program name
fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                options.shell = Some(args[i].clone());
            }
            "--cols" => {
                i += 1;
                options.cols = Some(parse_size("--cols", args.get(i))?);
            }
            "--rows" => {
                i += 1;
                options.rows = Some(parse_size("--rows", args.get(i))?);
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// A line typed at the console
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand<'a> {
    Quit,
    Resize { cols: u16, rows: u16 },
    Invalid(&'static str),
    Send(&'a str),
}

impl<'a> ConsoleCommand<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        match line.trim() {
            "" | "exit" | "quit" => return ConsoleCommand::Quit,
            _ => {}
        }

        let mut words = line.split_whitespace();
        if words.next() != Some("resize") {
            return ConsoleCommand::Send(line);
        }
        let size = |word: Option<&str>| word.and_then(|w| w.parse::<u16>().ok()).filter(|&n| n > 0);
        match (size(words.next()), size(words.next()), words.next()) {
            (Some(cols), Some(rows), None) => ConsoleCommand::Resize { cols, rows },
            _ => ConsoleCommand::Invalid("usage: resize <cols> <rows> (positive integers)"),
        }
    }
}

fn init_logging(config: &Config) {
    let log_path = Config::config_dir()
        .map(|dir| dir.join("ptyshell.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("ptyshell.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_thread_names(true)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Read the config file, falling back to the defaults on a bad file.
///
/// Logging is not up yet, so the problem is also returned for later logging.
fn load_config(options: &Options) -> anyhow::Result<(Config, Option<ConfigError>)> {
    let (mut config, problem) = match Config::try_load() {
        Ok(config) => (config, None),
        Err(e) => {
            eprintln!("Warning: {}; using default configuration", e);
            (Config::default(), Some(e))
        }
    };

    if let Some(shell) = &options.shell {
        config.shells.retain(|s| s != shell);
        config.shells.insert(0, shell.clone());
    }

    // Size priority: command line, then the controlling terminal, then config.
    let (term_cols, term_rows) = crossterm::terminal::size()
        .ok()
        .filter(|&(c, r)| c > 0 && r > 0)
        .unwrap_or((config.terminal.cols, config.terminal.rows));
    config.terminal.cols = options.cols.unwrap_or(term_cols);
    config.terminal.rows = options.rows.unwrap_or(term_rows);

    config
        .validate()
        .context("invalid command line options")?;
    Ok((config, problem))
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let (config, problem) = load_config(&options)?;
    init_logging(&config);
    info!("ptyshell {} starting", VERSION);
    if let Some(e) = problem {
        warn!("{}; using default configuration", e);
    }

    run_console(config)
}

fn run_console(config: Config) -> anyhow::Result<()> {
    let tag = config.output_tag.clone();
    let callback: OutputCallback = Arc::new(move |message: &str| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(strip_tag(message, &tag).as_bytes());
        let _ = stdout.flush();
    });

    let mut session = ShellSession::new(config);
    session.start(Some(callback));

    let stdin = io::stdin();
    let mut line = String::new();
    while session.is_running() {
        session.apply_pending_resize(|| crossterm::terminal::size().ok());

        print!("shell> ");
        io::stdout().flush()?;

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read console input: {}", e);
                break;
            }
        }

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Resize { cols, rows } => session.notify_resize(cols, rows),
            ConsoleCommand::Invalid(usage) => {
                warn!("Rejected console command: {}", line.trim_end());
                eprintln!("{}", usage);
            }
            ConsoleCommand::Send(text) => session.write(text),
        }
    }

    session.stop();
    info!("ptyshell exiting");
    Ok(())
}
