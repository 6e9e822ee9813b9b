//! Signaling message envelopes.
//!
//! Every client request carries a correlation id and receives exactly one
//! reply with the same id: either a success payload or a structured error.
//! Server-initiated notifications carry an `event` discriminator instead of
//! an id and are never acknowledged.

use serde::{Deserialize, Serialize};

use shopstream_core::Error;
use shopstream_sfu::{
    DtlsParameters, MediaKind, ProducerId, RtpParameters, TransportDirection, TransportId,
};

/// Client → server request envelope.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    /// Correlation id, echoed back in the reply
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ClientRequest {
    /// Enter the room this channel was opened for.
    JoinRoom,
    /// Create a send- or recv-direction transport.
    CreateTransport { direction: TransportDirection },
    /// Finalize the DTLS handshake for a transport.
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    /// Publish an inbound track (broadcaster only).
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Subscribe to a producer's track.
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
    },
    /// Stop publishing one track.
    CloseProducer { producer_id: ProducerId },
    /// Orderly disconnect.
    Leave,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Server → client reply envelope.
#[derive(Debug, Serialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(id: u64, data: impl Serialize) -> Self {
        Self {
            id,
            ok: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_room() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"id": 1, "method": "join-room"}"#).expect("parse");
        assert_eq!(envelope.id, 1);
        assert!(matches!(envelope.request, ClientRequest::JoinRoom));
    }

    #[test]
    fn test_parse_create_transport() {
        let envelope: ClientEnvelope = serde_json::from_str(
            r#"{"id": 2, "method": "create-transport", "direction": "recv"}"#,
        )
        .expect("parse");
        assert!(matches!(
            envelope.request,
            ClientRequest::CreateTransport {
                direction: TransportDirection::Recv
            }
        ));
    }

    #[test]
    fn test_parse_produce() {
        let envelope: ClientEnvelope = serde_json::from_str(
            r#"{
                "id": 3,
                "method": "produce",
                "transport_id": "t-1",
                "kind": "audio",
                "rtp_parameters": {
                    "mime_type": "audio/opus",
                    "payload_type": 111,
                    "clock_rate": 48000,
                    "ssrc": 4242
                }
            }"#,
        )
        .expect("parse");
        match envelope.request {
            ClientRequest::Produce {
                kind,
                rtp_parameters,
                ..
            } => {
                assert_eq!(kind, MediaKind::Audio);
                assert_eq!(rtp_parameters.ssrc, 4242);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result =
            serde_json::from_str::<ClientEnvelope>(r#"{"id": 4, "method": "transcode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_success_reply_shape() {
        let reply = Reply::success(7, serde_json::json!({"producer_id": "p-1"}));
        let json = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(json["id"], 7);
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"]["producer_id"], "p-1");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_reply_carries_stable_code() {
        let reply = Reply::failure(8, &Error::not_found("producer", "p-9"));
        let json = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "not_found");
        assert!(json.get("data").is_none());
    }
}
