//! Delivery of snapshots to the remote collector.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{error, info, warn};

/// Default number of delivery attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of [`MetricsSender::test_connection`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    /// The endpoint answered with a status below 500.
    Ok(u16),
    /// The endpoint answered with a 5xx status.
    ServerError(u16),
    /// Nothing is listening at the endpoint.
    Refused,
    /// Connecting or waiting for the answer took too long.
    Timeout,
    /// Any other transport failure.
    Other(String),
}

impl ConnectionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectionStatus::Ok(_))
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Ok(status) => write!(f, "Connection OK (status: {})", status),
            ConnectionStatus::ServerError(status) => write!(f, "Server error (status: {})", status),
            ConnectionStatus::Refused => write!(f, "Connection refused"),
            ConnectionStatus::Timeout => write!(f, "Connection timeout"),
            ConnectionStatus::Other(msg) => write!(f, "Connection error: {}", msg),
        }
    }
}

/// HTTP client that POSTs JSON payloads with bounded retries.
pub struct MetricsSender {
    endpoint: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    client: Option<Client>,
}

impl MetricsSender {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            client: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = None;
        self
    }

    /// Sets the number of attempts; values below 1 are raised to 1.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    fn client(&mut self) -> Result<&Client, reqwest::Error> {
        let client = match self.client.take() {
            Some(client) => client,
            None => Client::builder().timeout(self.timeout).build()?,
        };
        Ok(self.client.insert(client))
    }

    fn post<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
    ) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let endpoint = self.endpoint.clone();
        self.client()?
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
    }

    /// Sends `payload`, retrying on transport errors and non-2xx answers.
    ///
    /// Returns `false` once every attempt has failed.
    pub fn send<T: Serialize + ?Sized>(&mut self, payload: &T) -> bool {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            match self.post(payload) {
                Ok(response) if response.status().is_success() => {
                    info!("Metrics sent successfully to {}", self.endpoint);
                    return true;
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                    warn!(
                        "HTTP error {} sending metrics (attempt {}/{})",
                        response.status().as_u16(),
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Request error sending metrics: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_retries {
                std::thread::sleep(self.retry_delay);
            }
        }

        error!(
            "Failed to send metrics after {} attempts: {}",
            self.max_retries, last_error
        );
        false
    }

    /// Posts a minimal payload and classifies the answer.
    pub fn test_connection(&mut self) -> ConnectionStatus {
        match self.post(&serde_json::json!({ "test": true })) {
            Ok(response) if response.status().as_u16() < 500 => {
                ConnectionStatus::Ok(response.status().as_u16())
            }
            Ok(response) => ConnectionStatus::ServerError(response.status().as_u16()),
            Err(e) if e.is_timeout() => ConnectionStatus::Timeout,
            Err(e) if e.is_connect() => ConnectionStatus::Refused,
            Err(e) => ConnectionStatus::Other(e.to_string()),
        }
    }
}
