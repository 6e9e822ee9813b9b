//! RTP codec capabilities, negotiated parameters, and the packet shape
//! forwarded between producers and consumers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::MediaKind;

/// A codec the router is able to forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    /// e.g. "audio/opus" or "video/VP8"
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub preferred_payload_type: u8,
}

/// The negotiated codec set a room's router supports.
///
/// Every participant that joins the room receives the same capabilities;
/// a room keeps this set for its entire lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RouterCapabilities {
    /// The fixed codec set used for merchant broadcasts: Opus audio and VP8
    /// video. No simulcast or multi-layer negotiation.
    #[must_use]
    pub fn broadcast_default() -> Self {
        Self {
            codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    preferred_payload_type: 111,
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    preferred_payload_type: 96,
                },
            ],
        }
    }

    /// Whether the given parameters match a supported codec.
    #[must_use]
    pub fn supports(&self, kind: MediaKind, params: &RtpParameters) -> bool {
        self.codecs.iter().any(|c| {
            c.kind == kind
                && c.mime_type.eq_ignore_ascii_case(&params.mime_type)
                && c.clock_rate == params.clock_rate
        })
    }
}

/// Parameters describing one RTP stream, supplied by the publisher on
/// `produce` and handed unchanged to subscribers on `consume` (media is
/// forwarded, never re-encoded, so the stream description does not change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub ssrc: u32,
}

/// One RTP packet on the forwarding path.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub marker: bool,
    /// Encoded payload, forwarded byte-for-byte
    pub payload: Bytes,
}
