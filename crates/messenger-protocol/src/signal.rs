//! The `Signal` union relayed between conference participants.
//!
//! Signals are ephemeral: never persisted, only routed. The type is a
//! closed sum so the signaling router's `match` is checked for
//! exhaustiveness at compile time — adding a variant forces every routing
//! decision to be revisited.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Screen-share convenience action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenShareAction {
    Start,
    Stop,
}

/// Enforced action a moderator may apply to another participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeratorActionKind {
    /// Mute the target's audio producer.
    Mute,
    /// Remove the target from the conference.
    Kick,
}

/// Informational action a participant applies to themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserActionKind {
    Leave,
    RaiseHand,
}

/// Room-level action (layout switch, recording toggle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomActionKind {
    Layout,
    Record,
}

/// A conference signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Trickle ICE candidate.
    IceCandidate { candidate: Value },
    /// SDP offer.
    Offer { sdp: String },
    /// SDP answer.
    Answer { sdp: String },
    /// Stream metadata (track went live / went dark).
    Stream { producer_id: String, active: bool },
    /// Screen-share convenience signal; broadcast alongside the underlying
    /// producer lifecycle so UIs need not inspect producer kinds.
    ScreenShare { action: ScreenShareAction },
    /// Moderator action; authorization-gated by the router.
    ModeratorAction {
        action: ModeratorActionKind,
        target_user_id: String,
    },
    /// Self-applied participant action.
    UserAction { action: UserActionKind },
    /// Room-level action with an optional argument (layout name, ...).
    RoomAction {
        action: RoomActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

impl Signal {
    /// Whether relaying this signal requires a moderator privilege check.
    #[must_use]
    pub fn requires_moderator(&self) -> bool {
        matches!(self, Signal::ModeratorAction { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_wire_shape() {
        let signal = Signal::IceCandidate {
            candidate: json!({"sdpMid": "0", "candidate": "candidate:1 ..."}),
        };
        let encoded = serde_json::to_string(&signal).unwrap();
        assert!(encoded.contains("\"type\":\"ice-candidate\""));

        let decoded: Signal = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, signal);
    }

    #[test]
    fn test_moderator_gating_flag() {
        let mute = Signal::ModeratorAction {
            action: ModeratorActionKind::Mute,
            target_user_id: "u2".to_string(),
        };
        assert!(mute.requires_moderator());

        let hand = Signal::UserAction {
            action: UserActionKind::RaiseHand,
        };
        assert!(!hand.requires_moderator());
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let result: Result<Signal, _> =
            serde_json::from_str(r#"{"type":"teleport","where":"moon"}"#);
        assert!(result.is_err());
    }
}
