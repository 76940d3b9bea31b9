use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::errors::EnrichError;

use crate::backend::EnrichmentBackend;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Return this JSON value.
    Json(serde_json::Value),
    /// Return an error.
    Error(EnrichError),
    /// Wait a duration, then yield the inner response.
    Delayed(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Mock backend that returns pre-programmed responses in sequence.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Backend that fails every call, for exercising fallbacks.
    pub fn unavailable() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EnrichmentBackend for MockBackend {
    async fn infer(
        &self,
        _model: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(EnrichError::NetworkError("backend unavailable".into()));
        };

        let mut current = response;
        loop {
            match current {
                MockResponse::Json(value) => return Ok(value),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delayed(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
