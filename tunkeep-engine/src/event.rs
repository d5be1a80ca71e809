//! Tunnel states and status events

use serde::Serialize;
use tokio::sync::mpsc;

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// No session exists
    Disconnected,
    /// Session setup in progress
    Connecting,
    /// Engine running on a provisioned interface
    Connected,
    /// Tearing the session down
    Disconnecting,
    /// Waiting to rebuild the session after a network loss
    Reconnecting,
    /// Setup failed or reconnection gave up
    Error,
}

impl TunnelState {
    /// Check if the tunnel is fully connected
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Wire name used in the status stream
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Disconnecting => "disconnecting",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Error => "error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot delivered to the status observer on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: TunnelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_label: Option<String>,
}

impl StatusEvent {
    pub fn new(status: TunnelState) -> Self {
        Self {
            status,
            message: None,
            server_label: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the server label; an empty label is left out
    pub fn with_label(mut self, label: &str) -> Self {
        if !label.is_empty() {
            self.server_label = Some(label.to_string());
        }
        self
    }

    /// Render as `{"status": ..., "message": ..., "serverLabel": ...}`
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiver of status events
#[async_trait::async_trait]
pub trait StatusObserver: Send + Sync {
    /// Handle one transition. Calls are never concurrent.
    async fn on_status(&self, event: StatusEvent);
}

/// Observer forwarding every event into a channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl StatusObserver for ChannelObserver {
    async fn on_status(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Status receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_omits_absent_fields() {
        let json = StatusEvent::new(TunnelState::Disconnected).to_json().unwrap();
        assert_eq!(json, r#"{"status":"disconnected"}"#);
    }

    #[test]
    fn test_json_full_payload() {
        let event = StatusEvent::new(TunnelState::Reconnecting)
            .with_message("Attempt 1/5")
            .with_label("tokyo-1");
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["status"], "reconnecting");
        assert_eq!(value["message"], "Attempt 1/5");
        assert_eq!(value["serverLabel"], "tokyo-1");
    }

    #[test]
    fn test_empty_label_dropped() {
        let event = StatusEvent::new(TunnelState::Connected).with_label("");
        assert!(event.server_label.is_none());
    }

    #[test]
    fn test_state_predicates() {
        assert!(!TunnelState::Reconnecting.is_connected());
        assert!(TunnelState::Connected.is_connected());
        assert_eq!(TunnelState::Disconnecting.to_string(), "disconnecting");
    }
}
