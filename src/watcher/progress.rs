//! Wake progress reported to admin API clients

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// Events kept for clients that subscribe after a wake has started
pub const WAKE_EVENT_HISTORY: usize = 64;

const WAKE_EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeEventKind {
    Starting,
    WakingDep,
    DepReady,
    ContainerWoke,
    WaitingReady,
    Ready,
    Error,
}

impl WakeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeEventKind::Starting => "starting",
            WakeEventKind::WakingDep => "waking_dep",
            WakeEventKind::DepReady => "dep_ready",
            WakeEventKind::ContainerWoke => "container_woke",
            WakeEventKind::WaitingReady => "waiting_ready",
            WakeEventKind::Ready => "ready",
            WakeEventKind::Error => "error",
        }
    }
}

impl fmt::Display for WakeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WakeEvent {
    #[serde(rename = "type")]
    pub kind: WakeEventKind,
    pub message: String,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WakeEvent {
    pub fn new(kind: WakeEventKind, message: impl Into<String>, error: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            kind,
            message: message.into(),
            timestamp,
            error,
        }
    }

    /// One server-sent-events frame: `data: {json}\n\n`
    pub fn to_sse(&self) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(self).unwrap_or_default()
        )
    }
}

/// History of the current wake plus a broadcast to live subscribers
pub struct WakeEvents {
    history: Mutex<VecDeque<WakeEvent>>,
    live: broadcast::Sender<WakeEvent>,
}

impl WakeEvents {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(WAKE_EVENT_BUFFER);
        Self {
            history: Mutex::new(VecDeque::new()),
            live,
        }
    }

    pub fn send(&self, kind: WakeEventKind, message: impl Into<String>, error: Option<String>) {
        let event = WakeEvent::new(kind, message, error);
        debug!(event = %event.kind, message = %event.message, "wake event");

        let mut history = self.history.lock();
        if history.len() == WAKE_EVENT_HISTORY {
            history.pop_front();
        }
        history.push_back(event.clone());
        // No subscribers is fine
        let _ = self.live.send(event);
    }

    /// Drop the previous wake's events
    pub fn clear(&self) {
        self.history.lock().clear();
    }

    /// Past events and a receiver for the ones that follow, without gaps
    pub fn subscribe(&self) -> (Vec<WakeEvent>, broadcast::Receiver<WakeEvent>) {
        let history = self.history.lock();
        (history.iter().cloned().collect(), self.live.subscribe())
    }
}

impl Default for WakeEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_frame() {
        let event = WakeEvent {
            kind: WakeEventKind::WakingDep,
            message: "Waking dependency: db".to_string(),
            timestamp: 1_700_000_000_000,
            error: None,
        };
        assert_eq!(
            event.to_sse(),
            "data: {\"type\":\"waking_dep\",\"message\":\"Waking dependency: db\",\"timestamp\":1700000000000}\n\n"
        );

        let failed = WakeEvent::new(WakeEventKind::Error, "Failed to start db", Some("refused".to_string()));
        assert!(failed.to_sse().contains("\"error\":\"refused\""));
    }

    #[tokio::test]
    async fn test_subscriber_sees_history_then_live_events() {
        let events = WakeEvents::new();
        events.send(WakeEventKind::Starting, "whoami is starting...", None);

        let (history, mut live) = events.subscribe();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, WakeEventKind::Starting);

        events.send(WakeEventKind::ContainerWoke, "whoami started successfully", None);
        assert_eq!(live.recv().await.unwrap().kind, WakeEventKind::ContainerWoke);

        events.clear();
        assert!(events.subscribe().0.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let events = WakeEvents::new();
        for i in 0..WAKE_EVENT_HISTORY + 5 {
            events.send(WakeEventKind::WaitingReady, format!("poll {}", i), None);
        }
        let (history, _) = events.subscribe();
        assert_eq!(history.len(), WAKE_EVENT_HISTORY);
        assert_eq!(history[0].message, "poll 5");
    }
}
