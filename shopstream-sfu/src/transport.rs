//! Network transport entity and its ICE/DTLS negotiation data.
//!
//! A transport is one ICE/DTLS-negotiated path belonging to exactly one
//! participant and one room, tagged send or receive. This layer produces and
//! stores the negotiation descriptors and drives the DTLS state machine;
//! packet-level handshake I/O happens at the media edge.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use shopstream_core::{Error, Result};

use crate::types::{ParticipantId, TransportDirection, TransportId};

const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// ICE username fragment and password for one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

impl IceParameters {
    fn generate() -> Self {
        Self {
            username_fragment: nanoid!(8),
            password: nanoid!(24),
        }
    }
}

/// A single ICE candidate advertised to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub candidate_type: String,
}

impl IceCandidate {
    fn host(ip: String, port: u16) -> Self {
        Self {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip,
            port,
            protocol: "udp".to_string(),
            candidate_type: "host".to_string(),
        }
    }
}

/// Hash of the certificate used for the DTLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    fn generate() -> Self {
        let digest = nanoid!(64, &HEX);
        let value = digest
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).to_uppercase())
            .collect::<Vec<_>>()
            .join(":");
        Self {
            algorithm: "sha-256".to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// DTLS parameters exchanged during transport negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS connection state machine. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Connection parameters returned to the client so it can complete
/// negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Worker-side transport entity.
#[derive(Debug)]
pub(crate) struct Transport {
    pub(crate) id: TransportId,
    pub(crate) owner: ParticipantId,
    pub(crate) direction: TransportDirection,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_state: DtlsState,
    remote_dtls: Option<DtlsParameters>,
    last_activity: Instant,
}

impl Transport {
    pub(crate) fn new(
        owner: ParticipantId,
        direction: TransportDirection,
        ip: String,
        port: u16,
    ) -> Self {
        Self {
            id: TransportId::generate(),
            owner,
            direction,
            ice_parameters: IceParameters::generate(),
            ice_candidates: vec![IceCandidate::host(ip, port)],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint::generate()],
            },
            dtls_state: DtlsState::New,
            remote_dtls: None,
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor {
            transport_id: self.id.clone(),
            direction: self.direction,
            ice_parameters: self.ice_parameters.clone(),
            ice_candidates: self.ice_candidates.clone(),
            dtls_parameters: self.dtls_parameters.clone(),
        }
    }

    /// Finalize the DTLS handshake with the remote side's parameters.
    ///
    /// Valid only once, from the `New` state; connecting an
    /// already-connected (or closed) transport is an error rather than a
    /// silent success.
    pub(crate) fn connect(&mut self, remote: DtlsParameters) -> Result<()> {
        match self.dtls_state {
            DtlsState::New => {}
            DtlsState::Connecting | DtlsState::Connected => {
                return Err(Error::InvalidState(format!(
                    "transport {} is already connected",
                    self.id
                )));
            }
            DtlsState::Closed => {
                return Err(Error::InvalidState(format!(
                    "transport {} is closed",
                    self.id
                )));
            }
        }

        if remote.fingerprints.is_empty() {
            return Err(Error::Negotiation(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        self.dtls_state = DtlsState::Connecting;
        self.remote_dtls = Some(remote);
        self.dtls_state = DtlsState::Connected;
        self.touch();
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.dtls_state = DtlsState::Closed;
    }

    pub(crate) const fn state(&self) -> DtlsState {
        self.dtls_state
    }

    /// Record activity (negotiation progress or media flowing).
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(
            ParticipantId::from("p1"),
            TransportDirection::Send,
            "127.0.0.1".to_string(),
            40000,
        )
    }

    fn remote_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint::generate()],
        }
    }

    #[test]
    fn test_descriptor_contains_negotiation_material() {
        let t = transport();
        let desc = t.descriptor();
        assert_eq!(desc.direction, TransportDirection::Send);
        assert_eq!(desc.ice_candidates.len(), 1);
        assert_eq!(desc.ice_candidates[0].port, 40000);
        assert_eq!(desc.dtls_parameters.fingerprints.len(), 1);
        // sha-256 fingerprint: 32 colon-separated byte pairs
        assert_eq!(
            desc.dtls_parameters.fingerprints[0].value.split(':').count(),
            32
        );
    }

    #[test]
    fn test_connect_transitions_to_connected() {
        let mut t = transport();
        assert_eq!(t.state(), DtlsState::New);
        t.connect(remote_dtls()).expect("connect");
        assert_eq!(t.state(), DtlsState::Connected);
    }

    #[test]
    fn test_double_connect_is_invalid_state() {
        let mut t = transport();
        t.connect(remote_dtls()).expect("connect");
        let err = t.connect(remote_dtls()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_connect_without_fingerprint_is_negotiation_failure() {
        let mut t = transport();
        let err = t
            .connect(DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[test]
    fn test_connect_after_close_is_invalid_state() {
        let mut t = transport();
        t.close();
        let err = t.connect(remote_dtls()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_idle_detection() {
        let t = transport();
        let now = Instant::now();
        assert!(!t.is_idle(Duration::from_secs(60), now));
        assert!(t.is_idle(Duration::from_secs(0), now));
    }
}
