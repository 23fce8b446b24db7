//! Streaming endpoint protocol
//!
//! Both endpoint kinds take the same outbound payload: one binary message per
//! PCM frame, little-endian i16 samples, no header, no control messages.
//!
//! - `Raw`: a plain PCM sink (default `ws://localhost:8080`). Anything it
//!   sends back is treated as opaque.
//! - `Transcription`: a speech-recognition service. Stream parameters go in
//!   the query string and results come back as JSON with the text under
//!   `channel.alternatives[0].transcript`.

use serde::{Deserialize, Serialize};
use url::Url;

use super::StreamingError;

/// Endpoint used when nothing has been saved
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080";

/// Wire encoding name announced to transcription endpoints
const ENCODING: &str = "linear16";

/// Frames are mono (channel 0 of the device)
const CHANNELS: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    #[default]
    Raw,
    Transcription,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Raw => "raw",
            EndpointKind::Transcription => "transcription",
        }
    }
}

/// Everything needed to open one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    /// Value for the `Authorization` handshake header, if any
    pub authorization: Option<String>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            authorization: None,
        }
    }
}

/// A validated streaming endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    kind: EndpointKind,
    configured: String,
    url: Url,
}

impl Endpoint {
    /// Parse and validate a `ws://` or `wss://` URL.
    pub fn parse(kind: EndpointKind, url: &str) -> Result<Self, StreamingError> {
        let configured = url.trim();
        let parsed = Url::parse(configured)
            .map_err(|e| StreamingError::InvalidUrl(format!("{}: {}", url, e)))?;

        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(StreamingError::InvalidUrl(format!(
                    "{}: unsupported scheme '{}' (expected ws or wss)",
                    url, other
                )))
            }
        }
        if parsed.host_str().is_none() {
            return Err(StreamingError::InvalidUrl(format!("{}: missing host", url)));
        }

        Ok(Self {
            kind,
            configured: configured.to_string(),
            url: parsed,
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// The URL as configured (trimmed, no stream parameters)
    pub fn url(&self) -> &str {
        &self.configured
    }

    /// Build the connect request for a stream at `sample_rate`.
    ///
    /// Transcription endpoints get `encoding`, `sample_rate` and `channels`
    /// query parameters (replacing any already present). A token, when given,
    /// is sent as `Authorization: Token <token>`.
    pub fn request(&self, sample_rate: u32, token: Option<&str>) -> ConnectRequest {
        let url = match self.kind {
            EndpointKind::Raw => self.url.to_string(),
            EndpointKind::Transcription => {
                let mut url = self.url.clone();
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| !matches!(k.as_ref(), "encoding" | "sample_rate" | "channels"))
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs.clear();
                    for (k, v) in &kept {
                        pairs.append_pair(k, v);
                    }
                    pairs
                        .append_pair("encoding", ENCODING)
                        .append_pair("sample_rate", &sample_rate.to_string())
                        .append_pair("channels", &CHANNELS.to_string());
                }
                url.to_string()
            }
        };

        ConnectRequest {
            url,
            authorization: token.map(|t| format!("Token {}", t)),
        }
    }
}

/// One recognition result from a transcription endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    channel: RecognitionChannel,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct RecognitionChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// A decoded inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Transcript(Transcript),
    /// Valid JSON without a transcript (metadata, keep-alives, server notices)
    Json(serde_json::Value),
    /// Non-JSON text from a raw endpoint
    Text(String),
}

/// Decode an inbound text message.
///
/// JSON is always inspected for a transcript. Non-JSON text is opaque on a
/// raw endpoint and a [`StreamingError::DecodeError`] on a transcription
/// endpoint.
pub fn decode_text(kind: EndpointKind, text: &str) -> Result<Inbound, StreamingError> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return match kind {
                EndpointKind::Raw => Ok(Inbound::Text(text.to_string())),
                EndpointKind::Transcription => Err(StreamingError::DecodeError(e.to_string())),
            }
        }
    };

    match serde_json::from_value::<RecognitionResult>(value.clone()) {
        Ok(result) => match result.channel.alternatives.into_iter().next() {
            Some(best) => Ok(Inbound::Transcript(Transcript {
                text: best.transcript,
                is_final: result.is_final,
                confidence: best.confidence,
            })),
            None => Ok(Inbound::Json(value)),
        },
        Err(_) => Ok(Inbound::Json(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_ws_and_wss() {
        assert!(Endpoint::parse(EndpointKind::Raw, "ws://localhost:8080").is_ok());
        assert!(Endpoint::parse(EndpointKind::Raw, "wss://example.com/listen").is_ok());
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        let err = Endpoint::parse(EndpointKind::Raw, "http://localhost:8080").unwrap_err();
        assert!(matches!(err, StreamingError::InvalidUrl(_)));
        assert!(err.to_string().contains("http"));

        assert!(Endpoint::parse(EndpointKind::Raw, "not a url").is_err());
    }

    #[test]
    fn test_raw_request_is_url_verbatim() {
        let endpoint = Endpoint::parse(EndpointKind::Raw, DEFAULT_WS_URL).unwrap();
        assert_eq!(endpoint.url(), "ws://localhost:8080");
        let request = endpoint.request(48000, None);
        assert_eq!(request.url, "ws://localhost:8080/");
        assert!(request.authorization.is_none());
    }

    #[test]
    fn test_transcription_request_carries_stream_parameters() {
        let endpoint = Endpoint::parse(
            EndpointKind::Transcription,
            "wss://stt.example.com/v1/listen?model=general&sample_rate=8000",
        )
        .unwrap();
        let request = endpoint.request(48000, Some("abc123"));

        let url = Url::parse(&request.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("model".to_string(), "general".to_string())));
        assert!(pairs.contains(&("encoding".to_string(), "linear16".to_string())));
        assert!(pairs.contains(&("sample_rate".to_string(), "48000".to_string())));
        assert!(pairs.contains(&("channels".to_string(), "1".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "sample_rate").count(), 1);
        assert_eq!(request.authorization.as_deref(), Some("Token abc123"));
    }

    #[test]
    fn test_decode_transcript() {
        let json = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {
                "alternatives": [
                    { "transcript": "hello world", "confidence": 0.97 }
                ]
            }
        }"#;

        match decode_text(EndpointKind::Transcription, json).unwrap() {
            Inbound::Transcript(t) => {
                assert_eq!(t.text, "hello world");
                assert!(t.is_final);
                assert_eq!(t.confidence, Some(0.97));
            }
            other => panic!("Expected Transcript, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_json_without_transcript() {
        let json = r#"{ "type": "Metadata", "request_id": "r1" }"#;
        let decoded = decode_text(EndpointKind::Transcription, json).unwrap();
        assert!(matches!(decoded, Inbound::Json(_)));

        let empty = r#"{ "channel": { "alternatives": [] } }"#;
        assert!(matches!(
            decode_text(EndpointKind::Transcription, empty).unwrap(),
            Inbound::Json(_)
        ));
    }

    #[test]
    fn test_decode_non_json_depends_on_endpoint() {
        let text = "ack 42";
        assert_eq!(
            decode_text(EndpointKind::Raw, text).unwrap(),
            Inbound::Text("ack 42".to_string())
        );

        let err = decode_text(EndpointKind::Transcription, text).unwrap_err();
        assert!(matches!(err, StreamingError::DecodeError(_)));
    }

    #[test]
    fn test_raw_endpoint_still_reads_json_transcripts() {
        let json = r#"{ "channel": { "alternatives": [ { "transcript": "hi" } ] } }"#;
        match decode_text(EndpointKind::Raw, json).unwrap() {
            Inbound::Transcript(t) => {
                assert_eq!(t.text, "hi");
                assert!(!t.is_final);
                assert_eq!(t.confidence, None);
            }
            other => panic!("Expected Transcript, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_kind_serde() {
        let json = serde_json::to_string(&EndpointKind::Transcription).unwrap();
        assert_eq!(json, "\"transcription\"");
        let kind: EndpointKind = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(kind, EndpointKind::Raw);
    }
}
