use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::ApiError;
use crate::models::ReasonCode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    KeyVerified { code: ReasonCode },
    KeyRevoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub key_id: String,
    pub workspace_id: String,
    pub source_ip: Option<String>,
    pub time: DateTime<Utc>,
}

/// Fire-and-forget. Implementations must never block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Processes events off the request path.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), ApiError>;
}

/// Bounded queue drained by a background task. When the queue is full the
/// event is dropped and counted.
pub struct ChannelEventSink {
    tx: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    pub fn spawn(capacity: usize, handler: Arc<dyn EventHandler>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));

        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler.handle(event).await {
                    warn!(error = %e, "event handler failed");
                }
            }
        });

        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            consumer,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key_id = %event.key_id, "event queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key_id = %event.key_id, "event consumer stopped, dropping event");
            }
        }
    }
}

pub struct TracingEventHandler;

#[async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle(&self, event: Event) -> Result<(), ApiError> {
        let kind = serde_json::to_string(&event.kind)?;
        info!(
            target: "key_events",
            kind = %kind,
            key_id = %event.key_id,
            workspace_id = %event.workspace_id,
            source_ip = ?event.source_ip,
            time = %event.time.to_rfc3339(),
            "key event"
        );
        Ok(())
    }
}

/// Runs every handler in order; one failing does not stop the rest.
pub struct FanOut(pub Vec<Arc<dyn EventHandler>>);

#[async_trait]
impl EventHandler for FanOut {
    async fn handle(&self, event: Event) -> Result<(), ApiError> {
        let mut first_error = None;
        for handler in &self.0 {
            if let Err(e) = handler.handle(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
