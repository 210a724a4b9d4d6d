//! Report Envelope decode.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub report: String,
    pub key_id: Option<String>,
    pub is_truncate: bool,
    pub data: Vec<Map<String, Value>>,
}

#[derive(Debug)]
pub enum EnvelopeError {
    Utf8(std::string::FromUtf8Error),
    Json(serde_json::Error),
    MissingHeader,
    MissingReport,
    DataNotArray,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Utf8(e) => write!(f, "body is not valid UTF-8: {e}"),
            EnvelopeError::Json(e) => write!(f, "body is not valid JSON: {e}"),
            EnvelopeError::MissingHeader => write!(f, "envelope is missing the `header` object"),
            EnvelopeError::MissingReport => write!(f, "header is missing `report`"),
            EnvelopeError::DataNotArray => write!(f, "envelope `data` is not an array"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Decode a UTF-8 JSON body, tolerating a leading BOM, into an [`Envelope`].
/// Matches `Receive.read_json`'s `decode('utf-8-sig')`.
pub fn parse_envelope(body: &[u8]) -> Result<Envelope, EnvelopeError> {
    let stripped = body.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(body);
    let text = String::from_utf8(stripped.to_vec()).map_err(EnvelopeError::Utf8)?;
    let value: Value = serde_json::from_str(&text).map_err(EnvelopeError::Json)?;

    let header = value.get("header").ok_or(EnvelopeError::MissingHeader)?;
    let report = header
        .get("report")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingReport)?
        .to_string();
    let key_id = header
        .get("key_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_truncate = header
        .get("is_truncate")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let data = match value.get("data") {
        None => Vec::new(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(map) => out.push(map.clone()),
                    _ => return Err(EnvelopeError::DataNotArray),
                }
            }
            out
        }
        Some(_) => return Err(EnvelopeError::DataNotArray),
    };

    Ok(Envelope {
        report,
        key_id,
        is_truncate,
        data,
    })
}
