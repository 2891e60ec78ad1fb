//! Console host for the controller
//!
//! Stands in for an application shell: it owns the "host is alive" flag, turns
//! stdin lines into start/stop requests and prints every status change.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{info, warn};

use crate::config::Config;
use crate::controller::launcher::ChildLauncher;
use crate::controller::{ControllerSession, ControllerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Start,
    Stop,
    Status,
    Help,
    Quit,
}

impl HostCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Some(HostCommand::Start),
            "stop" => Some(HostCommand::Stop),
            "status" => Some(HostCommand::Status),
            "help" | "?" => Some(HostCommand::Help),
            "quit" | "exit" => Some(HostCommand::Quit),
            _ => None,
        }
    }
}

enum HostEvent {
    Line(String),
    InputClosed,
    Interrupted,
}

fn print_commands() {
    println!("Commands:");
    println!("    start     Launch the recorder and start recording");
    println!("    stop      Stop recording and wait for the video");
    println!("    status    Show the last recorder status");
    println!("    help      Show this list");
    println!("    quit      Stop any recording and exit");
}

fn spawn_stdin_reader(events: mpsc::Sender<HostEvent>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if events.send(HostEvent::Line(line)).is_err() {
                    return;
                }
            }
            let _ = events.send(HostEvent::InputClosed);
        })
        .map(|_| ())
}

/// Run the controller behind a line-based console until `quit`, EOF or Ctrl+C
pub fn run_console_host(config: Config) -> Result<()> {
    let settings = ControllerSettings::from_config(&config)?;
    let launcher = Arc::new(ChildLauncher::from_config(&config)?);
    let host_alive = Arc::new(AtomicBool::new(true));

    let (status_tx, status_rx) = mpsc::channel::<String>();
    let controller =
        ControllerSession::new(settings, launcher, host_alive.clone()).with_status_updates(status_tx);

    std::thread::Builder::new()
        .name("status-printer".to_string())
        .spawn(move || {
            for status in status_rx {
                println!("[recorder] {}", status);
            }
        })
        .context("Failed to spawn status printer")?;

    let (events_tx, events_rx) = mpsc::channel();
    let interrupt_tx = events_tx.clone();
    let interrupt_alive = host_alive.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        interrupt_alive.store(false, Ordering::SeqCst);
        let _ = interrupt_tx.send(HostEvent::Interrupted);
    })
    .context("Failed to install Ctrl+C handler")?;
    spawn_stdin_reader(events_tx).context("Failed to spawn stdin reader")?;

    let params = config.recording.start_params();
    if config.recording.record_on_launch {
        info!("Recording on launch");
        controller.request_start(params.clone());
    }
    print_commands();

    for event in events_rx {
        let line = match event {
            HostEvent::Line(line) => line,
            HostEvent::InputClosed => {
                info!("Console input closed");
                break;
            }
            HostEvent::Interrupted => break,
        };

        match HostCommand::parse(&line) {
            Some(HostCommand::Start) => controller.request_start(params.clone()),
            Some(HostCommand::Stop) => controller.request_stop(),
            Some(HostCommand::Status) => println!("{}", controller.status()),
            Some(HostCommand::Help) => print_commands(),
            Some(HostCommand::Quit) => break,
            None if line.trim().is_empty() => {}
            None => warn!("Unknown command {:?}; type `help` for the list", line.trim()),
        }
    }

    host_alive.store(false, Ordering::SeqCst);
    if controller.is_active() {
        println!("Waiting for the recorder to finish the video...");
    }
    controller.request_stop();
    info!("Host exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_commands() {
        assert_eq!(HostCommand::parse("start"), Some(HostCommand::Start));
        assert_eq!(HostCommand::parse("  STOP \n"), Some(HostCommand::Stop));
        assert_eq!(HostCommand::parse("exit"), Some(HostCommand::Quit));
        assert_eq!(HostCommand::parse("?"), Some(HostCommand::Help));
        assert_eq!(HostCommand::parse("record"), None);
    }
}
