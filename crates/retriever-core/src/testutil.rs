//! Test utilities: mock fetcher and reporter, configuration helpers.
//!
//! Mocks use `Arc<Mutex<_>>` for interior mutability, allowing test
//! assertions on recorded calls.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde_json::Value;

use crate::callbacks::CallbackRegistry;
use crate::config::EntityConfiguration;
use crate::entity::Entity;
use crate::error::AppError;
use crate::reporter::{RetrievalEvent, RetrievalReporter};
use crate::traits::Fetcher;

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher returning queued responses.
///
/// Sessions created with `new_session` share the queue and the request log.
#[derive(Clone, Default)]
pub struct MockFetcher {
    /// Each call pops the first element. If empty, returns `{}`.
    responses: Arc<Mutex<Vec<Result<Vec<u8>, AppError>>>>,
    requests: Arc<Mutex<Vec<String>>>,
    sessions: Arc<Mutex<usize>>,
}

impl MockFetcher {
    /// Queue JSON bodies.
    pub fn json(bodies: Vec<Value>) -> Self {
        Self::default().with_responses(bodies.iter().map(|b| b.to_string().into_bytes()).collect())
    }

    pub fn with_responses(self, bodies: Vec<Vec<u8>>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .extend(bodies.into_iter().map(Ok));
        self
    }

    pub fn with_error(self, error: AppError) -> Self {
        self.responses.lock().unwrap().push(Err(error));
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of sessions opened via `new_session`.
    pub fn sessions(&self) -> usize {
        *self.sessions.lock().unwrap()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, _headers: &IndexMap<String, String>) -> Result<Vec<u8>, AppError> {
        self.requests.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(b"{}".to_vec())
        } else {
            responses.remove(0)
        }
    }

    fn new_session(&self) -> Result<Self, AppError> {
        *self.sessions.lock().unwrap() += 1;
        Ok(self.clone())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl RetrievalReporter for MockReporter {
    fn report(&self, event: RetrievalEvent<'_>) {
        let label = match &event {
            RetrievalEvent::Started { .. } => "started",
            RetrievalEvent::PreRequestRejected { .. } => "pre_request_rejected",
            RetrievalEvent::Requesting { .. } => "requesting",
            RetrievalEvent::Retrieved { .. } => "retrieved",
            RetrievalEvent::Failed { .. } => "failed",
            RetrievalEvent::PostRequestRejected { .. } => "post_request_rejected",
            RetrievalEvent::Accepted { .. } => "accepted",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Load a configuration against the built-in callbacks.
pub fn test_config(value: Value) -> Arc<EntityConfiguration> {
    Arc::new(EntityConfiguration::from_value(value, &CallbackRegistry::with_builtins()).unwrap())
}

/// Build an entity from `(input, value)` pairs.
pub fn entity_with(config: &Arc<EntityConfiguration>, inputs: &[(&str, &str)]) -> Entity {
    let values: IndexMap<String, String> = inputs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Entity::new(Arc::clone(config), &values).unwrap()
}
