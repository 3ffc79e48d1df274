//! JSON attribute extraction.
//!
//! Records are opaque JSON documents; the primary key and the secondary
//! value are both derived by stringifying a configured attribute. Every
//! secondary comparison downstream is lexicographic on the extracted
//! string, so numeric callers must zero-pad to get numeric ranges.

use serde_json::Value;

use crate::errinput;
use crate::error::Result;

/// Extracts the named attribute from a JSON payload and renders it as a
/// string. Integers render in base-10, doubles with default precision,
/// booleans as "true"/"false", strings verbatim.
///
/// Fails with InvalidArgument when the attribute name is empty, the payload
/// is not a JSON object, or the attribute is absent, null, or of an
/// unsupported type (array, object).
pub fn extract_attr(payload: &[u8], attr: &str) -> Result<String> {
    if attr.is_empty() {
        return errinput!("attribute name not set");
    }

    let doc: Value = serde_json::from_slice(payload)
        .map_err(|e| crate::error::Error::InvalidArgument(format!("payload is not JSON: {e}")))?;

    let value = match &doc {
        Value::Object(map) => match map.get(attr) {
            Some(Value::Null) | None => {
                return errinput!("attribute {attr:?} not found in document")
            }
            Some(value) => value,
        },
        _ => return errinput!("payload is not a JSON object"),
    };

    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(u.to_string())
            } else if let Some(i) = n.as_i64() {
                Ok(i.to_string())
            } else {
                // f64 is the only remaining serde_json number representation.
                Ok(n.as_f64().unwrap_or_default().to_string())
            }
        }
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => errinput!("unsupported type for attribute {attr:?}"),
    }
}
