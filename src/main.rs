//! screen-recorder
//!
//! Records the primary display from a detached recorder process that a
//! controller drives over two local line-oriented pipes.

mod cancel;
mod config;
mod controller;
mod host;
mod liveness;
mod logging;
mod notice;
mod protocol;
mod recorder;
mod transport;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use config::Config;
use controller::launcher::RECORD_ARG;
use logging::LogRole;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    recorder: bool,
    config_path: Option<PathBuf>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            RECORD_ARG => parsed.recorder = true,
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(parsed)
}

fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            print_help();
            std::process::exit(2);
        }
    };

    if args.help {
        print_help();
        return Ok(());
    }

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let role = if args.recorder {
        LogRole::Recorder
    } else {
        LogRole::Controller
    };
    let _guard = logging::init_logging(role)?;
    info!(
        "screen-recorder {} starting as {:?} (config {:?})",
        env!("CARGO_PKG_VERSION"),
        role,
        config.config_path().ok()
    );

    let result = if args.recorder {
        recorder::run_recorder(&config)
    } else {
        if let Ok(dir) = logging::get_log_dir() {
            println!("Logs are written to {}", dir.display());
        }
        host::run_console_host(config)
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn print_help() {
    println!("screen-recorder - Detached screen recording driven by a controller");
    println!();
    println!("USAGE:");
    println!("    screen-recorder [OPTIONS]           Run the console controller");
    println!("    screen-recorder record [OPTIONS]    Run the recorder (launched by the controller)");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>    Use this configuration file");
    println!("    -h, --help         Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                    Set log level (e.g., debug, info, warn)");
    println!("    SCREEN_RECORDER_LOG_PATH    Override the log directory");
}
