//! Operator console
//!
//! Reads `@`-prefixed commands from stdin, one per line, and drives the
//! sorter service with them. Query results are printed to stdout as JSON
//! lines next to the report events; everything else goes to the log.

use anyhow::Result;
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use crate::{controller::StartOutcome, inventory::Color, service::SorterService};

const HELP: &str = "\
@listen                   (re)start the telemetry listener
@sort-all                 start the colour sort sequence
@cancel                   stop the sequence after the current script
@send <script>            send one script to the robot
@counts                   print the inventory counts
@status                   print sequence and quantity state
@adjust <color> <+n|-n>   correct a count (red, green or blue)
@help                     show this list
@quit                     shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Listen,
    SortAll,
    Cancel,
    Send(String),
    Counts,
    Status,
    Adjust { color: Color, delta: i64 },
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Commands start with '@' (try @help): {0}")]
    NotACommand(String),

    #[error("Unknown command: @{0}")]
    Unknown(String),

    #[error("@{command} expects {expected}")]
    Usage {
        command: &'static str,
        expected: &'static str,
    },

    #[error("Unknown colour '{0}' (expected red, green or blue)")]
    Color(String),

    #[error("Invalid adjustment '{0}' (expected +n or -n)")]
    Delta(String),
}

impl ConsoleCommand {
    /// Parse one input line; blank lines and `#` comments yield `None`
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let Some(body) = line.strip_prefix('@') else {
            return Err(ConsoleError::NotACommand(line.to_string()));
        };
        let mut words = body.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let command = match (name.as_str(), args.as_slice()) {
            ("listen", []) => ConsoleCommand::Listen,
            ("sort-all", []) => ConsoleCommand::SortAll,
            ("cancel", []) => ConsoleCommand::Cancel,
            ("send", [script]) => ConsoleCommand::Send(script.to_string()),
            ("counts", []) => ConsoleCommand::Counts,
            ("status", []) => ConsoleCommand::Status,
            ("adjust", [color, delta]) => ConsoleCommand::Adjust {
                color: Color::parse(color).ok_or_else(|| ConsoleError::Color(color.to_string()))?,
                delta: parse_delta(delta)?,
            },
            ("help", []) => ConsoleCommand::Help,
            ("quit", []) => ConsoleCommand::Quit,
            ("listen" | "sort-all" | "cancel" | "counts" | "status" | "help" | "quit", _) => {
                return Err(ConsoleError::Usage {
                    command: usage_name(&name),
                    expected: "no arguments",
                })
            }
            ("send", _) => {
                return Err(ConsoleError::Usage {
                    command: "send",
                    expected: "one script name",
                })
            }
            ("adjust", _) => {
                return Err(ConsoleError::Usage {
                    command: "adjust",
                    expected: "a colour and a signed amount",
                })
            }
            _ => return Err(ConsoleError::Unknown(name)),
        };
        Ok(Some(command))
    }
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)?.ok_or_else(|| ConsoleError::NotACommand(s.to_string()))
    }
}

fn usage_name(name: &str) -> &'static str {
    match name {
        "listen" => "listen",
        "sort-all" => "sort-all",
        "cancel" => "cancel",
        "counts" => "counts",
        "status" => "status",
        "help" => "help",
        _ => "quit",
    }
}

fn parse_delta(text: &str) -> Result<i64, ConsoleError> {
    match text.parse::<i64>() {
        Ok(0) | Err(_) => Err(ConsoleError::Delta(text.to_string())),
        Ok(delta) => Ok(delta),
    }
}

/// Run the console until `@quit`, Ctrl+C or SIGTERM
///
/// End of input stops reading but keeps the daemon running until a signal.
pub async fn run_console(service: &SorterService) -> Result<()> {
    info!("Console ready - type @help for commands");

    let mut reader = BufReader::new(io::stdin());
    let mut buffer = String::new();
    let mut stdin_open = true;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        buffer.clear();

        tokio::select! {
            read = reader.read_line(&mut buffer), if stdin_open => match read {
                Ok(0) => {
                    info!("End of input reached, waiting for Ctrl+C to stop");
                    stdin_open = false;
                }
                Ok(_) => match ConsoleCommand::parse(&buffer) {
                    Ok(Some(ConsoleCommand::Quit)) => {
                        info!("Quit requested");
                        break;
                    }
                    Ok(Some(command)) => execute(service, command).await,
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                },
                Err(e) => {
                    error!("Failed to read from stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn execute(service: &SorterService, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Listen => match service.start_listener().await {
            Ok(addr) => info!("Telemetry listener up on {}", addr),
            // The bind failure itself is reported by the listener
            Err(e) => error!("Listen failed: {}", e),
        },
        ConsoleCommand::SortAll => match service.start_sequence().await {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyRunning) => info!("Sort all is already running"),
            Ok(StartOutcome::NothingToRun) => warn!("No sequence steps configured"),
            Err(e) => error!("Sort all failed: {}", e),
        },
        ConsoleCommand::Cancel => {
            if let Err(e) = service.cancel_sequence().await {
                error!("Cancel failed: {}", e);
            }
        }
        ConsoleCommand::Send(script) => {
            // Failures are already reported by the service
            let _ = service.send_script(&script).await;
        }
        ConsoleCommand::Counts => match service.counts().await {
            Ok(counts) => println!("{}", json!({ "type": "counts", "counts": counts })),
            Err(e) => error!("Reading counts failed: {}", e),
        },
        ConsoleCommand::Status => match service.status().await {
            Ok(status) => {
                let addr = service.telemetry_addr().await.map(|addr| addr.to_string());
                println!(
                    "{}",
                    json!({ "type": "status", "telemetry": addr, "controller": status })
                );
            }
            Err(e) => error!("Status failed: {}", e),
        },
        ConsoleCommand::Adjust { color, delta } => {
            let _ = service.adjust_count(color, delta).await;
        }
        ConsoleCommand::Help => {
            for line in HELP.lines() {
                info!("{}", line);
            }
        }
        ConsoleCommand::Quit => {}
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ConsoleCommand {
        ConsoleCommand::parse(line).unwrap().unwrap()
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(parse("@listen"), ConsoleCommand::Listen);
        assert_eq!(parse("@sort-all"), ConsoleCommand::SortAll);
        assert_eq!(parse("  @cancel  "), ConsoleCommand::Cancel);
        assert_eq!(
            parse("@send roed_26.script"),
            ConsoleCommand::Send("roed_26.script".to_string())
        );
        assert_eq!(parse("@counts"), ConsoleCommand::Counts);
        assert_eq!(parse("@status"), ConsoleCommand::Status);
        assert_eq!(
            parse("@adjust red +3"),
            ConsoleCommand::Adjust { color: Color::Red, delta: 3 }
        );
        assert_eq!(
            parse("@adjust BLUE -1"),
            ConsoleCommand::Adjust { color: Color::Blue, delta: -1 }
        );
        assert_eq!(parse("@help"), ConsoleCommand::Help);
        assert_eq!(parse("@QUIT"), ConsoleCommand::Quit);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(ConsoleCommand::parse("").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("   \n").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("# counts after lunch").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            ConsoleCommand::parse("sort-all"),
            Err(ConsoleError::NotACommand("sort-all".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("@dance"),
            Err(ConsoleError::Unknown("dance".to_string()))
        );
        assert!(matches!(
            ConsoleCommand::parse("@send"),
            Err(ConsoleError::Usage { command: "send", .. })
        ));
        assert!(matches!(
            ConsoleCommand::parse("@listen 45123"),
            Err(ConsoleError::Usage { command: "listen", .. })
        ));
        assert!(matches!(
            ConsoleCommand::parse("@status now"),
            Err(ConsoleError::Usage { command: "status", .. })
        ));
        assert_eq!(
            ConsoleCommand::parse("@adjust purple +1"),
            Err(ConsoleError::Color("purple".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("@adjust green lots"),
            Err(ConsoleError::Delta("lots".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("@adjust green 0"),
            Err(ConsoleError::Delta("0".to_string()))
        );
    }

    #[test]
    fn from_str_requires_a_command() {
        assert_eq!("@cancel".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Cancel));
        assert!("".parse::<ConsoleCommand>().is_err());
    }
}
