//! Blocking socket table client.
//!
//! Each operation opens a fresh connection, sends one request, waits briefly
//! for one newline-terminated response and closes the connection. The
//! convenience methods never fail: transport and protocol problems are logged
//! and reported as a missing value.

use crate::protocol::{self, ProtocolError, Request, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Address used when none is given.
pub const DEFAULT_ADDR: &str = "127.0.0.1:7777";
/// Connect and receive timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);
/// Attempts made by [`Client::wait_for_server`].
pub const CONNECTION_ATTEMPTS: u32 = 60;
/// Pause between connection attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server unavailable after {attempts} connection attempts")]
    Unavailable { attempts: u32 },

    #[error("connection closed before a complete response arrived")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeout: Duration,
    connect_attempts: u32,
    retry_interval: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(DEFAULT_ADDR)
    }
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
            connect_attempts: CONNECTION_ATTEMPTS,
            retry_interval: RETRY_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Block until the server accepts a connection, retrying at a fixed interval.
    pub fn wait_for_server(&self) -> Result<(), ClientError> {
        for attempt in 1..=self.connect_attempts {
            match self.connect() {
                Ok(_) => {
                    debug!(addr = %self.addr, attempt, "Connected to server");
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr = %self.addr, attempt, error = %e, "Connection failed");
                    if attempt < self.connect_attempts {
                        thread::sleep(self.retry_interval);
                    }
                }
            }
        }

        warn!(addr = %self.addr, attempts = self.connect_attempts, "Maximum connection attempts exceeded");
        Err(ClientError::Unavailable {
            attempts: self.connect_attempts,
        })
    }

    /// Send one request and wait for its response.
    pub fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let started = Instant::now();
        let encoded = protocol::encode_request(request)?;

        let stream = self.connect()?;
        (&stream).write_all(&encoded)?;

        let mut reader = BufReader::new(&stream);
        let mut frame = Vec::new();
        reader.read_until(protocol::FRAME_DELIMITER, &mut frame)?;
        if frame.last() != Some(&protocol::FRAME_DELIMITER) {
            return Err(ClientError::Closed);
        }

        let response = protocol::decode_response(&frame)?;
        trace!(
            request = %request.kind(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Round trip"
        );
        Ok(response)
    }

    /// Value of `key`, or `default` when it is missing or the request fails.
    pub fn get(&self, key: &str, default: Value) -> Value {
        match self.request(&Request::get(key)) {
            Ok(Response::Entry(entry)) if !entry.value.is_null() => entry.value,
            Ok(_) => default,
            Err(e) => {
                warn!(key, error = %e, "GET failed");
                default
            }
        }
    }

    /// Value of `key` converted to `T`, or `default` when missing or of another type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key, Value::Null) {
            Value::Null => default,
            value => match serde_json::from_value(value) {
                Ok(typed) => typed,
                Err(e) => {
                    warn!(key, error = %e, "Unexpected value type");
                    default
                }
            },
        }
    }

    /// Every key with its current value. Empty when the request fails.
    pub fn get_all(&self) -> HashMap<String, Value> {
        match self.request(&Request::GetAll) {
            Ok(Response::All(entries)) => entries
                .into_iter()
                .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
                .collect(),
            Ok(other) => {
                warn!(response = ?other, "Unexpected GETALL response");
                HashMap::new()
            }
            Err(e) => {
                warn!(error = %e, "GETALL failed");
                HashMap::new()
            }
        }
    }

    /// Store `value` under `key`, returning the value echoed by the server.
    pub fn update(&self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.keyed(Request::update(key, value))
    }

    /// Remove `key`, returning the removed value.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.keyed(Request::delete(key))
    }

    fn keyed(&self, request: Request) -> Option<Value> {
        match self.request(&request) {
            Ok(Response::Entry(entry)) if !entry.value.is_null() => Some(entry.value),
            Ok(_) => None,
            Err(e) => {
                warn!(request = %request.kind(), key = ?request.key(), error = %e, "Request failed");
                None
            }
        }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for '{}'", self.addr),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::net::TcpListener;

    /// Serve one canned response per accepted connection.
    fn canned_server(responses: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                requests.push(line);
                (&stream).write_all(response.as_bytes()).unwrap();
            }
            requests
        });

        (addr, handle)
    }

    fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn test_requests_and_parsing() {
        let (addr, server) = canned_server(vec![
            "{\"key\":\"test1\",\"value\":0}\n",
            "{\"key\":\"test1\",\"value\":null}\n",
            "[{\"key\":\"a\",\"value\":1},{\"key\":\"b\",\"value\":\"x\"}]\n",
            "{\"key\":\"test1\",\"value\":7}\n",
        ]);
        let client = Client::new(addr).with_timeout(Duration::from_secs(5));

        assert_eq!(client.update("test1", 0), Some(json!(0)));
        assert_eq!(client.get("test1", json!("default")), json!("default"));

        let all = client.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"], json!("x"));

        assert_eq!(client.get_as::<i64>("test1", -1), 7);

        let requests = server.join().unwrap();
        let sent: Vec<Value> = requests
            .iter()
            .map(|r| serde_json::from_str(r).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                json!({"request": "UPDATE", "key": "test1", "value": 0}),
                json!({"request": "GET", "key": "test1"}),
                json!({"request": "GETALL"}),
                json!({"request": "GET", "key": "test1"}),
            ]
        );
    }

    #[test]
    fn test_get_as_type_mismatch_returns_default() {
        let (addr, server) = canned_server(vec!["{\"key\":\"k\",\"value\":\"text\"}\n"]);
        let client = Client::new(addr).with_timeout(Duration::from_secs(5));

        assert!(client.get_as::<bool>("k", true));
        server.join().unwrap();
    }

    #[test]
    fn test_truncated_response_is_closed_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(b"{\"key\":").unwrap();
        });

        let client = Client::new(addr).with_timeout(Duration::from_secs(5));
        assert!(matches!(
            client.request(&Request::get("k")),
            Err(ClientError::Closed)
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_unreachable_server_yields_defaults() {
        let client = Client::new(unused_addr());

        assert_eq!(client.get("k", json!("default")), json!("default"));
        assert_eq!(client.update("k", 1), None);
        assert_eq!(client.delete("k"), None);
        assert!(client.get_all().is_empty());
    }

    #[test]
    fn test_wait_for_server_gives_up() {
        let client = Client::new(unused_addr())
            .with_connect_attempts(3)
            .with_retry_interval(Duration::from_millis(5));

        match client.wait_for_server() {
            Err(ClientError::Unavailable { attempts }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
