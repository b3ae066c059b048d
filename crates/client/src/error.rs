use std::time::Duration;

use duet_protocol::EventKind;
use serde::Serialize;

/// Failure to hand a message to the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to encode {0} message: {1}")]
    Encode(EventKind, String),
    #[error("websocket send failed: {0}")]
    Send(String),
}

/// An offer or answer could not be delivered within the attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} not delivered after {attempts} attempt(s): {last}")]
pub struct DispatchError {
    pub kind: EventKind,
    pub attempts: u32,
    #[source]
    pub last: TransportError,
}

/// Negotiation step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationStep {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AttachMedia,
}

impl std::fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationStep::CreateOffer => "create offer",
            NegotiationStep::CreateAnswer => "create answer",
            NegotiationStep::SetLocalDescription => "set local description",
            NegotiationStep::SetRemoteDescription => "set remote description",
            NegotiationStep::AttachMedia => "attach local media",
        };
        f.write_str(name)
    }
}

/// Structured error handed to the UI layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "code", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CallError {
    #[error("could not access camera or microphone: {message}")]
    Media { message: String },
    #[error("failed to {step}: {message}")]
    Negotiation {
        step: NegotiationStep,
        message: String,
    },
    #[error("failed to deliver {event}: {message}")]
    Delivery { event: String, message: String },
    #[error("signaling server error {server_code}: {message}")]
    Server {
        server_code: String,
        message: String,
        event_id: Option<String>,
    },
    #[error("connection was not established within {}s", .timeout.as_secs())]
    EstablishmentTimeout {
        #[serde(rename = "timeoutMs", serialize_with = "as_millis")]
        timeout: Duration,
    },
    #[error("could not create peer connection: {message}")]
    PeerSetup { message: String },
}

impl CallError {
    /// Stable identifier for UI lookups.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Media { .. } => "media",
            CallError::Negotiation { .. } => "negotiation",
            CallError::Delivery { .. } => "delivery",
            CallError::Server { .. } => "server",
            CallError::EstablishmentTimeout { .. } => "establishment-timeout",
            CallError::PeerSetup { .. } => "peer-setup",
        }
    }

    pub(crate) fn negotiation(step: NegotiationStep, err: &anyhow::Error) -> Self {
        CallError::Negotiation {
            step,
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn media(err: &anyhow::Error) -> Self {
        CallError::Media {
            message: format!("{err:#}"),
        }
    }
}

impl From<DispatchError> for CallError {
    fn from(err: DispatchError) -> Self {
        CallError::Delivery {
            event: err.kind.to_string(),
            message: err.to_string(),
        }
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_becomes_delivery() {
        let err = DispatchError {
            kind: EventKind::Offer,
            attempts: 3,
            last: TransportError::NotConnected,
        };
        let call: CallError = err.into();
        assert_eq!(call.code(), "delivery");
        assert!(call.to_string().contains("offer not delivered after 3 attempt(s)"));
    }

    #[test]
    fn serialized_error_carries_code() {
        let err = CallError::EstablishmentTimeout {
            timeout: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""code":"establishment-timeout""#));
        assert!(json.contains(r#""timeoutMs":30000"#));
        assert_eq!(err.to_string(), "connection was not established within 30s");
    }

    #[test]
    fn negotiation_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("bad sdp").context("Failed to set remote description");
        let err = CallError::negotiation(NegotiationStep::SetRemoteDescription, &inner);
        assert_eq!(
            err.to_string(),
            "failed to set remote description: Failed to set remote description: bad sdp"
        );
    }
}
