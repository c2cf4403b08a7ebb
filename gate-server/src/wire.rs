//! The framed wire protocol: a session header, a stream of KV records
//! (json or binary flavor), and a trailing result record.
//! Frames are length-delimited; each payload is a single JSON object,
//! carried over `tokio_util::codec::LengthDelimitedCodec`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio_util::codec::LengthDelimitedCodec;

use gate_core::error::{CResult, Error};
use gate_core::index::KeyValue;

/// Builds the length-delimited framer both client and server frame
/// messages through: a 4-byte big-endian length prefix per JSON object.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().length_field_type::<u32>().big_endian().new_codec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

impl WireFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(WireFormat::Json),
            "binary" => Some(WireFormat::Binary),
            _ => None,
        }
    }
}

/// The first frame of every session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionHeader {
    pub format: String,
    #[serde(default, rename = "doDelete")]
    pub do_delete: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub topic: String,
}

pub fn decode_session_header(bytes: &[u8]) -> CResult<SessionHeader> {
    serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("bad session header: {e}")))
}

/// The server's one reply frame.
#[derive(Debug, Serialize)]
pub struct ResultRecord {
    pub ok: bool,
}

pub fn encode_result_frame(ok: bool) -> Vec<u8> {
    serde_json::to_vec(&ResultRecord { ok }).expect("ResultRecord serializes infallibly")
}

/// One decoded KV frame: either end-of-transfer, or a key/value pair ready
/// to feed the diff pipeline (`value == None` is never produced here;
/// client streams never carry deletions, which is a precondition the
/// comparison side of the pipeline relies on).
#[derive(Debug)]
pub struct DecodedFrame {
    pub eot: bool,
    pub kv: Option<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct RawJsonFrame<'a> {
    #[serde(borrow, default)]
    k: Option<&'a RawValue>,
    #[serde(borrow, default)]
    v: Option<&'a RawValue>,
    #[serde(default, rename = "EOT")]
    eot: bool,
}

#[derive(Debug, Deserialize)]
struct BinaryFrame {
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    v: Option<String>,
    #[serde(default, rename = "EOT")]
    eot: bool,
}

/// Decodes one KV frame. In `json` mode, `k`/`v` are
/// forwarded byte-for-byte as they arrived on the wire (via
/// `serde_json::value::RawValue`, not re-serialized) since the server
/// never interprets keys or values. In `binary` mode they're base64.
pub fn decode_kv_frame(bytes: &[u8], format: WireFormat) -> CResult<DecodedFrame> {
    match format {
        WireFormat::Json => {
            let frame: RawJsonFrame = serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("bad kv frame: {e}")))?;
            if frame.eot {
                return Ok(DecodedFrame { eot: true, kv: None });
            }
            let key = frame
                .k
                .ok_or_else(|| Error::Protocol("kv frame missing k".into()))?
                .get()
                .as_bytes()
                .to_vec();
            let value = frame.v.map(|v| v.get().as_bytes().to_vec());
            Ok(DecodedFrame { eot: false, kv: Some(KeyValue { key, value: non_empty(value) }) })
        }
        WireFormat::Binary => {
            let frame: BinaryFrame = serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("bad kv frame: {e}")))?;
            if frame.eot {
                return Ok(DecodedFrame { eot: true, kv: None });
            }
            let key = base64_decode(&frame.k.ok_or_else(|| Error::Protocol("kv frame missing k".into()))?)?;
            let value = frame.v.map(|v| base64_decode(&v)).transpose()?;
            Ok(DecodedFrame { eot: false, kv: Some(KeyValue { key, value: non_empty(value) }) })
        }
    }
}

/// Encodes a binary-mode KV frame; used by tests and by any client driving
/// the server in binary mode.
pub fn encode_binary_kv_frame(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let obj = serde_json::json!({
        "k": base64_encode(key),
        "v": value.map(base64_encode),
    });
    serde_json::to_vec(&obj).expect("kv frame serializes infallibly")
}

pub fn encode_eot_frame() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "EOT": true })).expect("EOT frame serializes infallibly")
}

fn non_empty(value: Option<Vec<u8>>) -> Option<Vec<u8>> {
    match value {
        Some(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

fn base64_decode(s: &str) -> CResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::Protocol(format!("bad base64 in kv frame: {e}")))
}

fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_json_mode_kv_frame_forwarding_raw_bytes() {
        let frame = br#"{"k":"a","v":{"nested":1},"EOT":false}"#;
        let decoded = decode_kv_frame(frame, WireFormat::Json).unwrap();
        assert!(!decoded.eot);
        let kv = decoded.kv.unwrap();
        assert_eq!(kv.key, br#""a""#);
        assert_eq!(kv.value.unwrap(), br#"{"nested":1}"#);
    }

    #[test]
    fn json_mode_empty_value_is_a_deletion() {
        let frame = br#"{"k":"a","v":"","EOT":false}"#;
        let decoded = decode_kv_frame(frame, WireFormat::Json).unwrap();
        // the raw JSON text `""` is not empty bytes, so this is NOT treated
        // as a deletion -- only an absent `v` field is.
        assert!(decoded.kv.unwrap().value.is_some());

        let frame = br#"{"k":"a","EOT":false}"#;
        let decoded = decode_kv_frame(frame, WireFormat::Json).unwrap();
        assert!(decoded.kv.unwrap().value.is_none());
    }

    #[test]
    fn eot_frame_carries_no_payload() {
        let decoded = decode_kv_frame(&encode_eot_frame(), WireFormat::Json).unwrap();
        assert!(decoded.eot);
        assert!(decoded.kv.is_none());
    }

    #[test]
    fn binary_mode_round_trips_bit_exactly() {
        for payload in [b"".as_slice(), b"hello".as_slice(), &[0u8, 1, 2, 255, 254]] {
            let frame = encode_binary_kv_frame(payload, Some(payload));
            let decoded = decode_kv_frame(&frame, WireFormat::Binary).unwrap();
            let kv = decoded.kv.unwrap();
            assert_eq!(kv.key, payload);
            if payload.is_empty() {
                assert!(kv.value.is_none());
            } else {
                assert_eq!(kv.value.unwrap(), payload);
            }
        }
    }

    #[test]
    fn binary_mode_absent_value_is_a_deletion() {
        let frame = encode_binary_kv_frame(b"a", None);
        let decoded = decode_kv_frame(&frame, WireFormat::Binary).unwrap();
        assert!(decoded.kv.unwrap().value.is_none());
    }

    #[test]
    fn unknown_format_is_rejected_by_the_caller() {
        assert_eq!(WireFormat::parse("json"), Some(WireFormat::Json));
        assert_eq!(WireFormat::parse("binary"), Some(WireFormat::Binary));
        assert_eq!(WireFormat::parse("xml"), None);
    }

    #[test]
    fn session_header_defaults_missing_fields() {
        let header = decode_session_header(br#"{"format":"json"}"#).unwrap();
        assert_eq!(header.format, "json");
        assert!(!header.do_delete);
        assert_eq!(header.token, "");
        assert_eq!(header.topic, "");
    }

    #[test]
    fn result_frame_encodes_ok_flag() {
        assert_eq!(encode_result_frame(true), br#"{"ok":true}"#);
        assert_eq!(encode_result_frame(false), br#"{"ok":false}"#);
    }
}
