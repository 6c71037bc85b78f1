//! Rendering target for the bound capture session.
//!
//! The connector hands a freshly acquired session to the [`Sink`] and waits
//! for the first frame ("data ready") before it counts the stream as bound.
//! Snapshots read frames back out of the sink.

use crate::errors::CameraError;
use crate::platform::CaptureSession;
use crate::types::{CameraFrame, Resolution};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Bind `session` and resolve once it delivers its first frame.
    ///
    /// A session already attached is stopped and replaced. On failure the
    /// new session is stopped and dropped.
    async fn attach(&self, session: Box<dyn CaptureSession>) -> Result<Resolution, CameraError>;

    /// Unbind and hand back the session so its owner can release it.
    fn detach(&self) -> Option<Box<dyn CaptureSession>>;

    fn has_session(&self) -> bool;

    fn pause(&self);

    fn play(&self);

    fn is_playing(&self) -> bool;

    /// Latest frame. While paused this is the frame shown when playback
    /// stopped.
    async fn current_frame(&self) -> Result<CameraFrame, CameraError>;
}

#[derive(Default)]
struct SinkState {
    session: Option<Box<dyn CaptureSession>>,
    playing: bool,
    last_frame: Option<CameraFrame>,
}

/// In-process sink that pulls frames from the session on demand.
#[derive(Clone)]
pub struct FrameSink {
    state: Arc<Mutex<SinkState>>,
    ready_timeout: Duration,
}

impl FrameSink {
    pub fn new(ready_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            ready_timeout,
        }
    }

    fn lock(state: &Mutex<SinkState>) -> MutexGuard<'_, SinkState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read one frame on the blocking pool and remember it.
    async fn pull_frame(&self) -> Result<CameraFrame, CameraError> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> Result<CameraFrame, CameraError> {
            let mut guard = Self::lock(&state);
            let session = guard
                .session
                .as_mut()
                .ok_or_else(|| CameraError::StreamError("no session attached".to_string()))?;
            let frame = session.read_frame()?;
            guard.last_frame = Some(frame.clone());
            Ok(frame)
        })
        .await
        .map_err(|e| CameraError::StreamError(format!("Task join error: {}", e)))?
    }
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Sink for FrameSink {
    async fn attach(&self, session: Box<dyn CaptureSession>) -> Result<Resolution, CameraError> {
        let session_id = session.id().to_string();
        {
            let mut guard = Self::lock(&self.state);
            if let Some(mut previous) = guard.session.replace(session) {
                log::debug!("Replacing session {} on sink", previous.id());
                previous.stop();
            }
            guard.last_frame = None;
            guard.playing = true;
        }

        let ready = match tokio::time::timeout(self.ready_timeout, self.pull_frame()).await {
            Ok(result) => result,
            Err(_) => Err(CameraError::StreamError(format!(
                "no frame within {}ms",
                self.ready_timeout.as_millis()
            ))),
        };

        match ready {
            Ok(frame) => {
                log::debug!(
                    "Session {} ready at {}x{}",
                    session_id,
                    frame.width,
                    frame.height
                );
                Ok(Resolution::new(frame.width, frame.height))
            }
            Err(e) => {
                log::warn!("Session {} failed to become ready: {}", session_id, e);
                let mut guard = Self::lock(&self.state);
                let ours = guard
                    .session
                    .as_ref()
                    .map(|s| s.id() == session_id)
                    .unwrap_or(false);
                if ours {
                    if let Some(mut session) = guard.session.take() {
                        session.stop();
                    }
                    guard.playing = false;
                }
                Err(e)
            }
        }
    }

    fn detach(&self) -> Option<Box<dyn CaptureSession>> {
        let mut guard = Self::lock(&self.state);
        guard.playing = false;
        guard.last_frame = None;
        guard.session.take()
    }

    fn has_session(&self) -> bool {
        Self::lock(&self.state).session.is_some()
    }

    fn pause(&self) {
        Self::lock(&self.state).playing = false;
    }

    fn play(&self) {
        let mut guard = Self::lock(&self.state);
        guard.playing = guard.session.is_some();
    }

    fn is_playing(&self) -> bool {
        Self::lock(&self.state).playing
    }

    async fn current_frame(&self) -> Result<CameraFrame, CameraError> {
        {
            let guard = Self::lock(&self.state);
            if guard.session.is_none() {
                return Err(CameraError::StreamError("no session attached".to_string()));
            }
            if !guard.playing {
                if let Some(frame) = &guard.last_frame {
                    return Ok(frame.clone());
                }
            }
        }
        self.pull_frame().await
    }
}
