//! Lifecycle events of entity retrieval, decoupled from the logging backend.

use crate::entity::Entity;
use crate::error::AppError;

/// Events emitted while an entity moves through its retrieval state machine.
#[derive(Debug, Clone, Copy)]
pub enum RetrievalEvent<'a> {
    Started {
        entity: &'a Entity,
    },
    PreRequestRejected {
        entity: &'a Entity,
        callback: &'static str,
    },
    Requesting {
        entity: &'a Entity,
        uri: &'a str,
        delay_ms: u64,
    },
    Retrieved {
        entity: &'a Entity,
        bytes: usize,
    },
    Failed {
        entity: &'a Entity,
        error: &'a AppError,
    },
    PostRequestRejected {
        entity: &'a Entity,
        callback: &'static str,
    },
    Accepted {
        entity: &'a Entity,
    },
}

/// Trait for receiving retrieval events.
pub trait RetrievalReporter: Send + Sync + Clone {
    fn report(&self, event: RetrievalEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl RetrievalReporter for TracingReporter {
    fn report(&self, event: RetrievalEvent<'_>) {
        match event {
            RetrievalEvent::Started { entity } => {
                tracing::info!(%entity, "Retrieving data");
            }
            RetrievalEvent::PreRequestRejected { entity, callback } => {
                tracing::info!(%entity, %callback, "Entity rejected before request");
            }
            RetrievalEvent::Requesting {
                entity,
                uri,
                delay_ms,
            } => {
                tracing::debug!(%entity, %uri, %delay_ms, "Sending request");
            }
            RetrievalEvent::Retrieved { entity, bytes } => {
                tracing::info!(%entity, %bytes, "Successfully retrieved data");
            }
            RetrievalEvent::Failed { entity, error } => {
                tracing::error!(%entity, %error, "Could not retrieve data");
            }
            RetrievalEvent::PostRequestRejected { entity, callback } => {
                tracing::info!(%entity, %callback, "Entity removed by filter callback");
            }
            RetrievalEvent::Accepted { entity } => {
                tracing::debug!(%entity, "Entity accepted");
            }
        }
    }
}
