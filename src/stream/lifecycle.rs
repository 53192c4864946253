use crate::error::AppError;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleDirective {
    /// Close the transport and drop buffered data and clock state.
    Suspend,
    /// Reset backoff and reconnect.
    Resume,
    Ignored,
}

/// Host-side half of the lifecycle event source.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    sender: mpsc::Sender<LifecycleEvent>,
}

impl LifecycleHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub async fn foreground(&self) -> Result<(), AppError> {
        self.send(LifecycleEvent::Foreground).await
    }

    pub async fn background(&self) -> Result<(), AppError> {
        self.send(LifecycleEvent::Background).await
    }

    pub async fn send(&self, event: LifecycleEvent) -> Result<(), AppError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| AppError::ChannelClosed("lifecycle events".to_string()))
    }
}

/// Tracks visibility and turns edge transitions into directives. Repeated
/// events for the current state are ignored.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    visible: bool,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self { visible: true }
    }
}

impl LifecycleController {
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn apply(&mut self, event: LifecycleEvent) -> LifecycleDirective {
        match (event, self.visible) {
            (LifecycleEvent::Background, true) => {
                self.visible = false;
                info!("consumer hidden, suspending stream");
                LifecycleDirective::Suspend
            }
            (LifecycleEvent::Foreground, false) => {
                self.visible = true;
                info!("consumer visible, resuming stream");
                LifecycleDirective::Resume
            }
            _ => LifecycleDirective::Ignored,
        }
    }
}
