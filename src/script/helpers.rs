//! Encoding helpers exposed to scripts.
//!
//! Editor scripts mostly decode some part of a message into readable text and encode it
//! back, so the usual suspects are registered directly in the engine.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rhai::{Blob, Engine, EvalAltResult};
use tracing::{error, info};

use crate::logger::LogLevel;

/// Percent-decode `input`. Invalid escapes are kept verbatim and `+` is left alone.
pub fn url_decode(input: &[u8]) -> Vec<u8> {
    urlencoding::decode_binary(input).into_owned()
}

/// Percent-encode every byte, including the unreserved characters `urlencoding::encode` keeps.
pub fn url_encode_all(input: &[u8]) -> String {
    input.iter().map(|b| format!("%{b:02X}")).collect()
}

/// Lowercase hex, two characters per byte, no separators.
pub fn to_hex(input: &[u8]) -> String {
    input.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse hex text, ignoring whitespace between digits.
pub fn from_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<u8> = input.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }
    digits
        .chunks(2)
        .map(|pair| match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(format!(
                "invalid hex digit in `{}`",
                String::from_utf8_lossy(pair)
            )),
        })
        .collect()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Register every helper into `engine`.
pub fn register(engine: &mut Engine) {
    engine.register_fn("urldecode", |s: &str| {
        String::from_utf8_lossy(&url_decode(s.as_bytes())).into_owned()
    });
    engine.register_fn("urldecode", |b: Blob| url_decode(&b));
    engine.register_fn("urlencode_all", |s: &str| url_encode_all(s.as_bytes()));
    engine.register_fn("urlencode_all", |b: Blob| url_encode_all(&b));

    engine.register_fn("b64encode", |s: &str| STANDARD.encode(s.as_bytes()));
    engine.register_fn("b64encode", |b: Blob| STANDARD.encode(b));
    engine.register_fn("b64decode", |s: &str| -> Result<Blob, Box<EvalAltResult>> {
        STANDARD
            .decode(s.trim())
            .map_err(|e| format!("b64decode: {e}").into())
    });

    engine.register_fn("to_hex", |b: Blob| to_hex(&b));
    engine.register_fn("to_hex", |s: &str| to_hex(s.as_bytes()));
    engine.register_fn("from_hex", |s: &str| -> Result<Blob, Box<EvalAltResult>> {
        from_hex(s).map_err(|e| format!("from_hex: {e}").into())
    });

    engine.register_fn("to_text", |b: Blob| String::from_utf8_lossy(&b).into_owned());

    engine.register_fn("log_info", |s: &str| info!(target: "script", "{s}"));
    engine.register_fn("log_error", |s: &str| error!(target: "script", "{s}"));
    engine.register_fn("log", |level: &str, s: &str| LogLevel::parse(level).emit_script(s));
}
