//! Pre-configured signaling payloads.
//!
//! Provides:
//! - RTP parameters for a VP8 video stream and an Opus audio stream
//! - Capability sets (full, audio-only)
//! - Client DTLS parameters for `connectTransport`

use room_controller::media::types::{
    default_media_codecs, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters,
};
use serde_json::Value;
use std::collections::BTreeMap;

use common::RoomId;

/// Parse a room id, panicking on invalid input.
#[must_use]
pub fn room(id: &str) -> RoomId {
    RoomId::parse(id).expect("test room id must be valid")
}

/// RTP parameters for a VP8 video stream with the given SSRC.
#[must_use]
pub fn vp8_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            rid: None,
        }],
    }
}

/// RTP parameters for a stereo Opus audio stream with the given SSRC.
#[must_use]
pub fn opus_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::from([("useinbandfec".to_string(), Value::from(1))]),
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            rid: None,
        }],
    }
}

/// Capabilities of a client that can receive every default codec.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
        header_extensions: vec![],
    }
}

/// Capabilities of a client that can only receive audio.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs()
            .into_iter()
            .filter(|codec| codec.kind == MediaKind::Audio)
            .collect(),
        header_extensions: vec![],
    }
}

/// Client-side DTLS parameters.
#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}
