//! Outbound transport seam
//!
//! The engine does not bundle an HTTP client. Hosts plug in whatever network
//! stack the platform provides by implementing [`Transport`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::remote::provider::ProviderRequest;

/// Performs one outbound call and returns the raw response body.
///
/// Network and HTTP-level failures should map to [`RemoteError::Unavailable`].
/// Timeouts are enforced by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> Result<String, RemoteError>;
}

/// Returns the same body for every call, optionally after a delay.
///
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct StaticTransport {
    body: String,
    delay: Duration,
    calls: AtomicU64,
}

impl StaticTransport {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls received
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn send(&self, _request: ProviderRequest) -> Result<String, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.body.clone())
    }
}
