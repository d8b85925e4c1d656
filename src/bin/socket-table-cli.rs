//! socket-table CLI client
//!
//! Sends one request to a running server and prints the JSON response.

use clap::{Parser, Subcommand};
use serde_json::Value;
use socket_table::client::{Client, DEFAULT_ADDR};
use socket_table::protocol::{Request, Response};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// socket-table CLI
#[derive(Parser, Debug)]
#[command(name = "socket-table-cli")]
#[command(version)]
#[command(about = "CLI for the socket-table key-value server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = DEFAULT_ADDR)]
    server: String,

    /// Connect and receive timeout in milliseconds
    #[arg(short, long, default_value_t = 500)]
    timeout_ms: u64,

    /// Retry until the server accepts a connection before sending
    #[arg(long)]
    wait: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// List every key and value
    GetAll,

    /// Set a key to a value
    Update {
        /// The key to set
        key: String,

        /// The value, parsed as JSON when possible and sent as a string otherwise
        value: String,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },
}

impl Commands {
    fn into_request(self) -> Request {
        match self {
            Commands::Get { key } => Request::get(key),
            Commands::GetAll => Request::GetAll,
            Commands::Update { key, value } => Request::update(key, parse_value(&value)),
            Commands::Delete { key } => Request::delete(key),
        }
    }
}

/// `42`, `true` and `{"a":1}` are JSON; anything else is a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let client = Client::new(args.server).with_timeout(Duration::from_millis(args.timeout_ms));
    if args.wait {
        client.wait_for_server()?;
    }

    let response = client.request(&args.command.into_request())?;
    match response {
        Response::Null => println!("null"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("{\"a\":[1,2]}"), json!({"a": [1, 2]}));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["socket-table-cli", "update", "test1", "5"]);
        assert_eq!(args.server, DEFAULT_ADDR);
        match args.command.into_request() {
            Request::Update { key, value } => {
                assert_eq!(key.as_deref(), Some("test1"));
                assert_eq!(value, json!(5));
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let args = Args::parse_from(["socket-table-cli", "-s", "10.0.0.1:9000", "get-all"]);
        assert_eq!(args.server, "10.0.0.1:9000");
        assert!(matches!(args.command.into_request(), Request::GetAll));
    }
}
