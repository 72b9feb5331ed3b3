use crate::{ArtifactRef, Engine, Operation, OperationError, Status};
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

/// Emitted once per run, after it reaches Done or Failed.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    pub id: Uuid,
    pub operation: Operation,
    pub engine: Engine,
    pub database: String,
    pub status: Status,
    pub duration_ms: u64,
    pub error: Option<OperationError>,
    pub artifact: Option<ArtifactRef>,
}

/// Receives run notifications, e.g. to forward them to an alerting system.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &OperationEvent);
}

/// Default observer: writes each event to the log as one JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl EventObserver for LogObserver {
    fn on_event(&self, event: &OperationEvent) {
        match serde_json::to_string(event) {
            Ok(json) => match event.status {
                Status::Success => info!("operation event: {json}"),
                Status::Partial => warn!("operation event: {json}"),
                Status::Failed => error!("operation event: {json}"),
            },
            Err(e) => warn!("Failed to serialize operation event {}: {e}", event.id),
        }
    }
}
