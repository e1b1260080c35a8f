//! In-memory transport for tests and dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::TransportError;
use crate::scenario::{RequestDescriptor, Transport, TransportResponse};

#[derive(Debug, Clone)]
enum Route {
    Status(u16),
    Error,
}

/// Answers every request after a fixed latency without touching the network.
///
/// Latency is spent with `tokio::time::sleep`, so runs under a paused clock
/// complete instantly while still observing the configured durations.
#[derive(Debug)]
pub struct SimulatedTransport {
    status: u16,
    latency: Duration,
    body: Bytes,
    routes: HashMap<String, Route>,
    requests: AtomicU64,
}

impl SimulatedTransport {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            latency: Duration::ZERO,
            body: Bytes::new(),
            routes: HashMap::new(),
            requests: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Answer requests for `path` with a different status.
    pub fn with_route(mut self, path: impl Into<String>, status: u16) -> Self {
        self.routes.insert(path.into(), Route::Status(status));
        self
    }

    /// Fail requests for `path` with a transport error.
    pub fn with_route_error(mut self, path: impl Into<String>) -> Self {
        self.routes.insert(path.into(), Route::Error);
        self
    }

    /// Number of requests received so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn execute(&self, request: &RequestDescriptor) -> Result<TransportResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let status = match self.routes.get(&request.path) {
            Some(Route::Error) => {
                return Err(TransportError::Request(format!(
                    "connection refused: {}",
                    request.path
                )))
            }
            Some(Route::Status(status)) => *status,
            None => self.status,
        };

        Ok(TransportResponse {
            status,
            duration: self.latency,
            body: self.body.clone(),
        })
    }
}
