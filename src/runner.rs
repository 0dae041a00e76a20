//! Runs a sync endpoint against the relay, driven from standard input.
//!
//! Each input line is one of:
//! - `key=value`: change a variable (pushed with locking)
//! - a JSON object or a line containing `$`: data emitted by the device
//! - `show`: print the current state

use labsync_core::{
    DeviceLink, EndpointConfig, InboundUpdate, Notification, RelayClient, Role, SyncEndpoint,
    Value, Variables,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;

/// Capacity of the endpoint's outbound queue.
const OUTBOUND_BUFFER: usize = 64;

/// A parsed line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Set { key: String, value: Value },
    Device(String),
    Show,
    Invalid(String),
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == "show" {
        return Some(Input::Show);
    }
    if line.starts_with('{') || line.contains('$') {
        return Some(Input::Device(line.to_string()));
    }

    let input = match line.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Input::Set {
            key: key.trim().to_string(),
            value: Value::parse(value),
        },
        _ => Input::Invalid(format!("expected key=value, got '{}'", line)),
    };
    Some(input)
}

/// Stand-in for the serial device: logs what would be written to it.
struct LogDevice;

impl DeviceLink for LogDevice {
    fn write(&self, state: &str) -> std::io::Result<()> {
        tracing::info!("device <- {}", state);
        Ok(())
    }
}

fn format_variables(variables: &Variables) -> String {
    serde_json::to_string(variables).unwrap_or_else(|_| "{}".to_string())
}

/// Connects to the relay and runs until the connection closes or Ctrl-C.
pub async fn run_endpoint(config: &Config, role: Role) -> Result<(), Box<dyn std::error::Error>> {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let device: Option<Arc<dyn DeviceLink>> = match role {
        Role::Experiment => Some(Arc::new(LogDevice)),
        Role::Web => None,
    };

    let endpoint = Arc::new(SyncEndpoint::new(
        EndpointConfig {
            role,
            interval: config.interval(),
            variables: config.variables.value.clone(),
        },
        outbound_tx,
        device,
    )?);

    let client = RelayClient::new(config.server_url.value.clone());
    let connection = client.connect(role, &config.room.value).await?;
    println!(
        "Joined room '{}' as {} (supervision window {} ms)",
        config.room.value, role, config.interval_ms.value
    );

    let notifications = tokio::spawn(print_notifications(endpoint.subscribe()));
    let input = tokio::spawn(read_input(endpoint.clone()));

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = connection.run(&endpoint, outbound_rx) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    input.abort();
    notifications.abort();
    endpoint.shutdown().await;
    result
}

async fn print_notifications(mut notifications: broadcast::Receiver<Notification>) {
    loop {
        match notifications.recv().await {
            Ok(Notification::Changed(variables)) => {
                println!("state: {}", format_variables(&variables));
            }
            Ok(Notification::Locked) => println!("locked: waiting for acknowledgement"),
            Ok(Notification::Confirmed) => println!("confirmed"),
            Ok(Notification::RolledBack) => println!("rolled back: change was not acknowledged"),
            Ok(Notification::PeerSilent) => println!("peer silent"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Skipped {} notifications", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn read_input(endpoint: Arc<SyncEndpoint>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };

        match parse_input(&line) {
            Some(Input::Set { key, value }) => {
                if endpoint.is_locked().await {
                    println!("note: a change is still awaiting acknowledgement");
                }
                if let Err(e) = endpoint.set(key, value, true).await {
                    println!("error: {}", e);
                }
            }
            Some(Input::Device(data)) => {
                if let Err(e) = endpoint.device_data(InboundUpdate::Raw(data)).await {
                    println!("error: {}", e);
                }
            }
            Some(Input::Show) => {
                println!("state: {}", format_variables(&endpoint.snapshot().await));
            }
            Some(Input::Invalid(message)) => println!("error: {}", message),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set() {
        assert_eq!(
            parse_input("btn1=true"),
            Some(Input::Set {
                key: "btn1".to_string(),
                value: Value::Bool(true)
            })
        );
        assert_eq!(
            parse_input(" speed = 4 "),
            Some(Input::Set {
                key: "speed".to_string(),
                value: Value::from(4)
            })
        );
    }

    #[test]
    fn test_parse_device_lines() {
        assert_eq!(
            parse_input(r#"{"btn1": false}"#),
            Some(Input::Device(r#"{"btn1": false}"#.to_string()))
        );
        assert_eq!(
            parse_input("$ready"),
            Some(Input::Device("$ready".to_string()))
        );
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_input("   "), None);
        assert_eq!(parse_input("show"), Some(Input::Show));
        assert!(matches!(parse_input("nonsense"), Some(Input::Invalid(_))));
        assert!(matches!(parse_input("=1"), Some(Input::Invalid(_))));
    }
}
