use crate::impl_control_codec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Voice,
    Video,
}

/// Call negotiation opener. Clients send `recipient_id`, `kind` and
/// the opaque `sdp`; the hub assigns `call_id` and stamps `caller_id`
/// before fanning the offer out to the callee's sessions.
///
/// The SDP body is never inspected; the hub only sequences it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOffer {
    #[serde(default)]
    pub call_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub kind: CallKind,
    pub sdp: Value,
    #[serde(default)]
    pub caller_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub call_id: String,
    pub sdp: Value,
    #[serde(default)]
    pub callee_id: String,
}

/// Trickle ICE candidate, relayed verbatim to the other participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub call_id: String,
    pub candidate: Value,
    #[serde(default)]
    pub sender_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    Hangup,
    Rejected,
    Timeout,
    CalleeOffline,
    PeerDisconnected,
}

impl CallEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::CalleeOffline => "callee-offline",
            Self::PeerDisconnected => "peer-disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnd {
    pub call_id: String,
    pub reason: CallEndReason,
}

impl_control_codec!(CallOffer);
impl_control_codec!(CallAnswer);
impl_control_codec!(IceCandidate);
impl_control_codec!(CallEnd);
