//! Ordered lifecycle event channel.
//!
//! Every component publishes onto one [`EventBus`]; observers subscribe once
//! and receive events in publication order.

use crate::errors::CameraError;
use crate::types::{DeviceId, StreamIdx};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum LifecycleAction {
    #[serde(rename_all = "camelCase")]
    Connected {
        slot: StreamIdx,
        device_id: DeviceId,
        width: u32,
        height: u32,
    },
    Disconnected,
    #[serde(rename_all = "camelCase")]
    DeviceChange { video_count: usize },
    DeviceRemoved,
    /// Published before the retry is issued.
    #[serde(rename_all = "camelCase")]
    RetryConnect {
        slot: StreamIdx,
        attempt: u32,
        width: u32,
        height: u32,
    },
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    #[serde(flatten)]
    pub action: LifecycleAction,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<CameraError>,
    pub timestamp: DateTime<Utc>,
}

fn serialize_error<S: Serializer>(error: &Option<CameraError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_str(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl LifecycleEvent {
    pub fn new(action: LifecycleAction) -> Self {
        Self {
            action,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: CameraError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn exception(error: CameraError) -> Self {
        Self::new(LifecycleAction::Exception).with_error(error)
    }

    pub fn name(&self) -> &'static str {
        match self.action {
            LifecycleAction::Connected { .. } => "connected",
            LifecycleAction::Disconnected => "disconnected",
            LifecycleAction::DeviceChange { .. } => "deviceChange",
            LifecycleAction::DeviceRemoved => "deviceRemoved",
            LifecycleAction::RetryConnect { .. } => "retryConnect",
            LifecycleAction::Exception => "exception",
        }
    }

    /// JSON form handed to observers outside the process.
    pub fn to_json(&self) -> Result<String, CameraError> {
        serde_json::to_string(self)
            .map_err(|e| CameraError::StreamError(format!("Failed to serialize event: {}", e)))
    }
}

/// Single outbound channel for lifecycle notifications
pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<LifecycleEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publish to every current subscriber. Events published with nobody
    /// listening are dropped.
    pub fn publish(&self, event: LifecycleEvent) {
        log::debug!("Lifecycle event: {}", event.name());
        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                let _ = sender.send(event);
            }
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let receiver = match self.sender.lock() {
            Ok(guard) => guard.as_ref().map(|s| s.subscribe()),
            Err(_) => None,
        };
        EventStream { receiver }
    }

    /// Drop the sender; subscribers drain what is buffered and then see the
    /// end of the stream.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Subscriber end of the [`EventBus`]
pub struct EventStream {
    receiver: Option<broadcast::Receiver<LifecycleEvent>>,
}

impl EventStream {
    /// Next event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, {} events skipped", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything currently buffered
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
