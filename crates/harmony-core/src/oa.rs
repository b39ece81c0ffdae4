//! OA request/reply message types and the hub's status-code policy.
//!
//! OA messages are the hub-specific command layer.  Each message carries a
//! `mime` string that selects the payload schema, an optional status code and
//! error string on replies, and a flat field mapping encoded with
//! [`crate::payload`].  The transport wraps them in a generic IQ envelope;
//! this module knows nothing about the envelope.

use std::sync::OnceLock;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use uuid::Uuid;

use crate::payload::{self, Payload, PayloadError, Value};

/// Mime strings for the OA message schemas this client speaks.
pub mod mime {
    /// Anonymous pairing exchange that yields a session token.
    pub const PAIR: &str = "vnd.logitech.connect/vnd.logitech.pair";

    /// Start (or stop) an activity on the hub.
    pub const START_ACTIVITY: &str =
        "vnd.logitech.harmony/vnd.logitech.harmony.engine?startactivity";

    /// Short alias some hub firmware uses on start-activity replies.
    pub const START_ACTIVITY_SHORT: &str = "harmony.engine?startActivity";
}

/// Status codes the hub puts in the `errorcode` attribute.
pub mod status {
    /// Intermediate reply; the real reply is still coming.
    pub const CONTINUE: &str = "100";
    pub const SUCCESS: &str = "200";
    /// Device not configured; start-activity only, recoverable.
    pub const NOT_CONFIGURED: &str = "401";
    /// Bluetooth not connected.
    pub const BLUETOOTH_DISCONNECTED: &str = "506";
    /// Command not found for device, recoverable.
    pub const COMMAND_NOT_FOUND: &str = "566";
}

/// Activity id understood by the hub as "stop whatever is running".
pub const STOP_CURRENT_ACTIVITY: i64 = -1;

/// Device identifier advertised in the pairing request name field.
const DEVICE_IDENTIFIER: &str = "iOS6.0.1#iPhone";

/// Error type for OA reply handling.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The reply's mime string matches no schema this client knows.
    #[error("unable to handle reply type '{0}'")]
    UnhandledReplyType(String),

    /// The reply carried a status code outside the accepted set.
    #[error("got error response [{code}]: {message}")]
    ErrorResponse { code: String, message: String },

    /// A correlated reply envelope arrived without an OA element inside.
    #[error("reply stanza carried no oa element")]
    MissingOaElement,

    /// The reply body failed the strict nested payload parse.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// An outbound OA request: a mime discriminator plus its field mapping.
#[derive(Debug, Clone)]
pub struct OaRequest {
    pub mime: &'static str,
    pub payload: Payload,
}

impl OaRequest {
    /// Builds the anonymous pairing request.
    ///
    /// The `name` field carries a fresh random id so the hub can tell
    /// concurrent pairing attempts apart, suffixed with the device identifier
    /// the hub expects from a remote-control client.
    pub fn pair() -> Self {
        let unique = BASE64.encode(Uuid::new_v4().to_string());
        let mut payload = Payload::new();
        payload.insert("method", "pair");
        payload.insert("name", format!("{unique}#{DEVICE_IDENTIFIER}"));
        Self {
            mime: mime::PAIR,
            payload,
        }
    }

    /// Builds a start-activity request.  Pass [`STOP_CURRENT_ACTIVITY`] to
    /// power everything off.
    pub fn start_activity(activity_id: i64) -> Self {
        let mut payload = Payload::new();
        payload.insert("activityId", activity_id);
        payload.insert("timestamp", timestamp_ms() as i64);
        Self {
            mime: mime::START_ACTIVITY,
            payload,
        }
    }

    /// The encoded body placed as the envelope's text content.
    pub fn body(&self) -> String {
        payload::encode(&self.payload)
    }
}

/// Milliseconds since the first OA request of this process.
///
/// The hub only uses the timestamp to order requests from one client, so a
/// process-relative clock is enough.  Lazily initialised; no set-up call.
fn timestamp_ms() -> u128 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis()
}

// ── Replies ───────────────────────────────────────────────────────────────────

/// A decoded OA reply.
#[derive(Debug, Clone, PartialEq)]
pub struct OaReply {
    pub mime: String,
    pub status_code: Option<String>,
    pub error_string: Option<String>,
    pub payload: Payload,
}

impl OaReply {
    /// Parses a reply from the envelope attributes and text body.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnhandledReplyType`] for an unknown mime,
    /// [`ProtocolError::ErrorResponse`] for a status code outside the schema's
    /// accepted set, and [`ProtocolError::Payload`] for a body whose nested
    /// mappings fail to parse.
    pub fn parse(
        mime: &str,
        status_code: Option<&str>,
        error_string: Option<&str>,
        body: &str,
    ) -> Result<Self, ProtocolError> {
        if !is_known_mime(mime) {
            return Err(ProtocolError::UnhandledReplyType(mime.to_string()));
        }
        if !valid_status(mime, status_code) {
            return Err(ProtocolError::ErrorResponse {
                code: status_code.unwrap_or_default().to_string(),
                message: error_string.unwrap_or_default().to_string(),
            });
        }
        let payload = payload::decode(status_code, error_string, body)?;
        Ok(Self {
            mime: mime.to_string(),
            status_code: status_code.map(str::to_string),
            error_string: error_string.map(str::to_string),
            payload,
        })
    }

    /// True for an intermediate reply that must be skipped while waiting.
    pub fn is_continue(&self) -> bool {
        self.status_code.as_deref() == Some(status::CONTINUE)
    }

    /// The session token from a pairing reply (`identity` field), used as
    /// both username and password on the authenticated connection.
    pub fn session_token(&self) -> Option<String> {
        self.payload.get("identity").and_then(Value::to_text)
    }
}

fn is_known_mime(mime: &str) -> bool {
    matches!(
        mime,
        mime::PAIR | mime::START_ACTIVITY | mime::START_ACTIVITY_SHORT
    )
}

/// The baseline accepted codes, plus `401` for start-activity replies only
/// (a device that is not set up correctly reports it; the activity still
/// stops, so it is not treated as a failure).
fn valid_status(mime: &str, code: Option<&str>) -> bool {
    let baseline = matches!(
        code,
        Some(status::CONTINUE)
            | Some(status::SUCCESS)
            | Some(status::BLUETOOTH_DISCONNECTED)
            | Some(status::COMMAND_NOT_FOUND)
    );
    if baseline {
        return true;
    }
    matches!(mime, mime::START_ACTIVITY | mime::START_ACTIVITY_SHORT)
        && code == Some(status::NOT_CONFIGURED)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_request_carries_method_and_device_name() {
        let req = OaRequest::pair();
        assert_eq!(req.mime, mime::PAIR);
        assert_eq!(
            req.payload.get("method").and_then(Value::as_str),
            Some("pair")
        );
        let name = req
            .payload
            .get("name")
            .and_then(Value::as_str)
            .expect("name field");
        assert!(name.ends_with("#iOS6.0.1#iPhone"), "got name {name}");
    }

    #[test]
    fn test_pair_request_names_are_unique_per_request() {
        let a = OaRequest::pair();
        let b = OaRequest::pair();
        assert_ne!(a.payload.get("name"), b.payload.get("name"));
    }

    #[test]
    fn test_start_activity_request_fields() {
        let req = OaRequest::start_activity(STOP_CURRENT_ACTIVITY);
        assert_eq!(req.mime, mime::START_ACTIVITY);
        assert_eq!(req.payload.get("activityId"), Some(&Value::Int(-1)));
        assert!(matches!(
            req.payload.get("timestamp"),
            Some(Value::Int(ms)) if *ms >= 0
        ));
        let body = req.body();
        assert!(body.starts_with("activityId=-1:timestamp="), "got {body}");
    }

    #[test]
    fn test_parse_pair_reply_extracts_session_token() {
        let body = "serverIdentity=ed23c162a01b9ef7b2729c553eb8d7c0f841f7a3:hubId=106:\
                    identity=ed23c162a01b9ef7b2729c553eb8d7c0f841f7a3:status=succeeded:\
                    protocolVersion={XMPP=\"1.0\", HTTP=\"1.0\"}:productId=Pimento:friendlyName=ia";
        let reply = OaReply::parse(mime::PAIR, Some("200"), Some("OK"), body).expect("parse");
        assert_eq!(
            reply.session_token().as_deref(),
            Some("ed23c162a01b9ef7b2729c553eb8d7c0f841f7a3")
        );
        assert!(!reply.is_continue());
    }

    #[test]
    fn test_parse_reply_with_all_digit_token_still_yields_text() {
        let reply =
            OaReply::parse(mime::PAIR, Some("200"), None, "identity=1234567890").expect("parse");
        assert_eq!(reply.session_token().as_deref(), Some("1234567890"));
    }

    #[test]
    fn test_pair_reply_without_identity_has_no_token() {
        let reply = OaReply::parse(mime::PAIR, Some("200"), None, "status=succeeded").expect("parse");
        assert_eq!(reply.session_token(), None);
    }

    #[test]
    fn test_continue_status_is_flagged() {
        let reply = OaReply::parse(mime::PAIR, Some("100"), None, "").expect("parse");
        assert!(reply.is_continue());
    }

    #[test]
    fn test_unknown_mime_is_rejected() {
        let err = OaReply::parse("vnd.logitech.unknown", Some("200"), None, "").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnhandledReplyType("vnd.logitech.unknown".to_string())
        );
    }

    #[test]
    fn test_not_configured_accepted_for_start_activity_only() {
        assert!(OaReply::parse(mime::START_ACTIVITY, Some("401"), None, "").is_ok());
        assert!(OaReply::parse(mime::START_ACTIVITY_SHORT, Some("401"), None, "").is_ok());

        let err = OaReply::parse(mime::PAIR, Some("401"), Some("denied"), "").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ErrorResponse {
                code: "401".to_string(),
                message: "denied".to_string(),
            }
        );
    }

    #[test]
    fn test_recoverable_device_codes_are_accepted_everywhere() {
        for code in ["506", "566"] {
            assert!(OaReply::parse(mime::PAIR, Some(code), None, "").is_ok());
            assert!(OaReply::parse(mime::START_ACTIVITY, Some(code), None, "").is_ok());
        }
    }

    #[test]
    fn test_unexpected_status_code_is_an_error_response() {
        let err = OaReply::parse(mime::START_ACTIVITY, Some("503"), Some("busy"), "").unwrap_err();
        assert!(matches!(err, ProtocolError::ErrorResponse { code, .. } if code == "503"));
    }

    #[test]
    fn test_malformed_nested_body_propagates_payload_error() {
        let err = OaReply::parse(mime::PAIR, Some("200"), None, "hubProfiles={broken}").unwrap_err();
        assert!(matches!(err, ProtocolError::Payload(_)));
    }
}
