//! Text codec for the hub's key/value payload format.
//!
//! Wire format:
//! ```text
//! key1=value1:key2=value2:nested={a=1, b="two"}
//! ```
//! Flat `key=value` pairs joined with `:`; a value opening with `{` is a
//! nested mapping whose inner pairs are separated by a comma and an optional
//! space.  Scalars are tried as quoted string, then integer, then float, and
//! fall back to the raw text.
//!
//! Parsing is deliberately asymmetric: a top-level segment that is not a
//! `key=value` pair is skipped, while a malformed pair *inside* a nested
//! mapping is a hard [`PayloadError`].  The top level of a hub reply mixes in
//! metadata segments that are not worth failing on; the nested mappings carry
//! device state that must not be silently misread.

use std::fmt;

use thiserror::Error;

/// Error type for payload decoding.
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    /// A nested mapping contained something that is not a `key=value` pair.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A single payload field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Map(Payload),
}

impl Value {
    /// Returns the value as a borrowed string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Renders a scalar value as text.  Returns `None` for nested mappings.
    ///
    /// Hub fields that are logically strings (session tokens, ids) can decode
    /// as integers when they happen to be all digits; callers that need the
    /// text use this instead of [`Value::as_str`].
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            Value::Float(f) => Some(format!("{f:?}")),
            Value::Map(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// An insertion-ordered field mapping.
///
/// The hub matches fields by name, so order should not matter to it, but
/// encoding in insertion order keeps outbound bytes deterministic and makes
/// wire-level test comparison possible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    entries: Vec<(String, Value)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field, replacing the value in place if the key exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut p = Payload::new();
        for (k, v) in iter {
            p.insert(k, v);
        }
        p
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a payload as colon-joined `key=value` text.
///
/// Nested mappings render as `{k=v, k=v}`.  Strings are written bare (the
/// format has no escaping), so keys and string values must not contain `:`
/// or `=`; the fields this client sends never do.
pub fn encode(payload: &Payload) -> String {
    payload
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes a reply body, folding the optional status attributes in as fields.
///
/// # Errors
///
/// Returns [`PayloadError::Malformed`] only for a broken pair *inside* a
/// nested mapping; broken top-level segments are skipped.
pub fn decode(
    status_code: Option<&str>,
    error_string: Option<&str>,
    body: &str,
) -> Result<Payload, PayloadError> {
    let mut payload = Payload::new();
    if let Some(code) = status_code {
        payload.insert("statusCode", code);
    }
    if let Some(message) = error_string {
        payload.insert("errorString", message);
    }
    for segment in body.split(':') {
        // Lazy key match: everything before the first '='.
        let Some((key, raw)) = segment.split_once('=') else {
            continue;
        };
        let value = if raw.starts_with('{') {
            Value::Map(decode_nested(raw)?)
        } else {
            parse_scalar(raw)
        };
        payload.insert(key, value);
    }
    Ok(payload)
}

/// Decodes a `{k=v, k=v}` nested mapping.  Strict: every inner pair must
/// parse, unlike the permissive top level.
fn decode_nested(raw: &str) -> Result<Payload, PayloadError> {
    let inner = raw
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| PayloadError::Malformed(format!("unterminated mapping: {raw}")))?;

    let mut segments: Vec<&str> = inner
        .split(',')
        .map(|s| s.strip_prefix(' ').unwrap_or(s))
        .collect();
    while segments.last().is_some_and(|s| s.is_empty()) {
        segments.pop();
    }

    let mut map = Payload::new();
    for segment in segments {
        let Some((key, value)) = segment.split_once('=') else {
            return Err(PayloadError::Malformed(format!(
                "failed to parse element in reply: {inner}"
            )));
        };
        let value = if value.starts_with('{') {
            Value::Map(decode_nested(value)?)
        } else {
            parse_scalar(value)
        };
        map.insert(key, value);
    }
    Ok(map)
}

/// Scalar parse order: quoted string, integer, float, raw text.
fn parse_scalar(raw: &str) -> Value {
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
        {
            return Value::Str(raw[1..raw.len() - 1].to_string());
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(raw.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_flat_pairs_joined_with_colons() {
        let mut p = Payload::new();
        p.insert("method", "pair");
        p.insert("activityId", -1i64);
        assert_eq!(encode(&p), "method=pair:activityId=-1");
    }

    #[test]
    fn test_encode_nested_mapping_uses_braces_and_comma_space() {
        let mut inner = Payload::new();
        inner.insert("XMPP", "1.0");
        inner.insert("HTTP", "1.0");
        let mut p = Payload::new();
        p.insert("protocolVersion", Value::Map(inner));
        assert_eq!(encode(&p), "protocolVersion={XMPP=1.0, HTTP=1.0}");
    }

    #[test]
    fn test_decode_encode_round_trip_preserves_fields() {
        let mut p = Payload::new();
        p.insert("method", "pair");
        p.insert("count", 42i64);
        p.insert("name", "abc#def");
        let decoded = decode(None, None, &encode(&p)).expect("decode");
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_decode_status_attributes_become_fields() {
        let p = decode(Some("200"), Some("OK"), "status=ok").expect("decode");
        assert_eq!(p.get("statusCode").and_then(Value::as_str), Some("200"));
        assert_eq!(p.get("errorString").and_then(Value::as_str), Some("OK"));
        assert_eq!(p.get("status").and_then(Value::as_str), Some("ok"));
    }

    #[test]
    fn test_decode_skips_top_level_segment_without_equals() {
        let p = decode(None, None, "garbage:identity=tok123").expect("decode");
        assert_eq!(p.len(), 1);
        assert_eq!(p.get("identity").and_then(Value::as_str), Some("tok123"));
    }

    #[test]
    fn test_decode_empty_body_yields_empty_payload() {
        let p = decode(None, None, "").expect("decode");
        assert!(p.is_empty());
    }

    #[test]
    fn test_decode_nested_mapping_with_quoted_values() {
        let p = decode(
            None,
            None,
            r#"protocolVersion={XMPP="1.0", HTTP="1.0", RF="1.0"}"#,
        )
        .expect("decode");
        let Some(Value::Map(versions)) = p.get("protocolVersion") else {
            panic!("expected nested mapping");
        };
        assert_eq!(versions.get("XMPP").and_then(Value::as_str), Some("1.0"));
        assert_eq!(versions.get("RF").and_then(Value::as_str), Some("1.0"));
    }

    #[test]
    fn test_decode_nested_malformed_pair_is_an_error() {
        let err = decode(None, None, "hubProfiles={Harmony}").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn test_decode_unterminated_nested_mapping_is_an_error() {
        let err = decode(None, None, "hubProfiles={Harmony=2.0").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn test_top_level_malformed_is_skipped_but_nested_is_not() {
        // Same shape of breakage, opposite outcomes by level.
        assert!(decode(None, None, "notapair").is_ok());
        assert!(decode(None, None, "m={notapair}").is_err());
    }

    #[test]
    fn test_scalar_parse_order_int_then_float_then_raw() {
        assert_eq!(parse_scalar("106"), Value::Int(106));
        assert_eq!(parse_scalar("-1"), Value::Int(-1));
        assert_eq!(parse_scalar("2.5"), Value::Float(2.5));
        assert_eq!(parse_scalar("Pimento"), Value::Str("Pimento".to_string()));
        // Hex-looking tokens are not integers.
        assert_eq!(
            parse_scalar("ed23c162a01b"),
            Value::Str("ed23c162a01b".to_string())
        );
    }

    #[test]
    fn test_scalar_quotes_are_stripped() {
        assert_eq!(parse_scalar("'2.0'"), Value::Str("2.0".to_string()));
        assert_eq!(parse_scalar("\"x\""), Value::Str("x".to_string()));
        // Mismatched quotes fall through to raw text.
        assert_eq!(parse_scalar("'oops"), Value::Str("'oops".to_string()));
    }

    #[test]
    fn test_nested_trailing_empty_segments_are_dropped() {
        let p = decode(None, None, "m={a=1,}").expect("decode");
        let Some(Value::Map(m)) = p.get("m") else {
            panic!("expected mapping");
        };
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_doubly_nested_mapping_round_trips() {
        let body = "outer={inner={a=1}, b=2}";
        let p = decode(None, None, body).expect("decode");
        assert_eq!(encode(&p), body);
    }

    #[test]
    fn test_insert_replaces_existing_key_in_place() {
        let mut p = Payload::new();
        p.insert("a", 1i64);
        p.insert("b", 2i64);
        p.insert("a", 3i64);
        assert_eq!(encode(&p), "a=3:b=2");
    }

    #[test]
    fn test_value_to_text_coerces_scalars() {
        assert_eq!(Value::Int(106).to_text(), Some("106".to_string()));
        assert_eq!(Value::Str("x".into()).to_text(), Some("x".to_string()));
        assert_eq!(Value::Map(Payload::new()).to_text(), None);
    }
}
