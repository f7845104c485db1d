//! Scripted transport for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{LikeTransport, TransportError, UpstreamBody};

/// Replays queued responses in order, then falls back to a fixed answer
/// (a plain success unless configured otherwise).
pub struct MockTransport {
    script: Mutex<VecDeque<Result<UpstreamBody, TransportError>>>,
    fallback: Result<UpstreamBody, TransportError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, String)>>,
    call_count: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(UpstreamBody::success("Mock", "0", "IND", 100, 200)),
            delay: None,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        }
    }

    pub fn failing(err: TransportError) -> Self {
        Self::new().with_fallback(Err(err))
    }

    pub fn with_fallback(mut self, fallback: Result<UpstreamBody, TransportError>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Result<UpstreamBody, TransportError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LikeTransport for MockTransport {
    async fn fetch(&self, target_id: &str, region: &str) -> Result<UpstreamBody, TransportError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((target_id.to_string(), region.to_string()));
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
