//! Décodage des corps de réponse Schedules Direct
//!
//! Les réponses des lots (schedules, programs, metadata) sont des tableaux
//! JSON, éventuellement compressés en gzip. Un objet d'erreur
//! `{code, message, programID}` peut remplacer un enregistrement dans le
//! tableau : il est reconnu à sa forme puis décodé séparément.

use crate::error::{EpgError, Result};
use crate::models::EntityError;
use flate2::read::MultiGzDecoder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::borrow::Cow;
use std::io::Read;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One element of a batch answer
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<T> {
    Record(T),
    Error(EntityError),
}

pub fn is_gzip(raw: &[u8]) -> bool {
    raw.starts_with(&GZIP_MAGIC)
}

/// Inflates gzip bodies, passes anything else through untouched
pub fn inflate<'a>(context: &'static str, raw: &'a [u8]) -> Result<Cow<'a, [u8]>> {
    if !is_gzip(raw) {
        return Ok(Cow::Borrowed(raw));
    }
    let mut out = Vec::with_capacity(raw.len() * 4);
    MultiGzDecoder::new(raw)
        .read_to_end(&mut out)
        .map_err(|source| EpgError::Inflate { context, source })?;
    Ok(Cow::Owned(out))
}

fn malformed(context: &'static str, what: &str) -> EpgError {
    EpgError::decode(context, <serde_json::Error as serde::de::Error>::custom(what))
}

fn api_error(object: &serde_json::Map<String, Value>) -> Option<EpgError> {
    let code = object.get("code").and_then(Value::as_i64)?;
    if code == 0 {
        return None;
    }
    let message = object
        .get("message")
        .or_else(|| object.get("response"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some(EpgError::Api { code, message })
}

/// Decodes an envelope answer (`token`, `status`, `lineups`...)
///
/// A non-zero `code` field turns into [`EpgError::Api`].
pub fn decode_envelope<T: DeserializeOwned>(context: &'static str, raw: &[u8]) -> Result<T> {
    let body = inflate(context, raw)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| EpgError::decode(context, e))?;
    if let Some(err) = value.as_object().and_then(api_error) {
        return Err(err);
    }
    serde_json::from_value(value).map_err(|e| EpgError::decode(context, e))
}

/// Splits a batch answer into its elements
///
/// A whole-request error object in place of the array becomes
/// [`EpgError::Api`]; any other non-array body is malformed.
pub fn split_batch(context: &'static str, raw: &[u8]) -> Result<Vec<Value>> {
    let body = inflate(context, raw)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| EpgError::decode(context, e))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(object) => Err(api_error(&object)
            .unwrap_or_else(|| malformed(context, "expected a JSON array"))),
        _ => Err(malformed(context, "expected a JSON array")),
    }
}

/// Whether a batch element is an error object rather than a record
///
/// Errors carry a non-zero top-level `code`, or a `data` object with a
/// `code` (artwork records carry `data` as an array).
pub fn looks_like_error(item: &Value) -> bool {
    let Some(object) = item.as_object() else {
        return false;
    };
    let top_level = object
        .get("code")
        .and_then(Value::as_i64)
        .is_some_and(|code| code != 0);
    let nested = object
        .get("data")
        .and_then(Value::as_object)
        .is_some_and(|data| data.contains_key("code"));
    top_level || nested
}

/// Decodes every element of a batch, with the error-object fallback
///
/// An element that is neither a record nor an error object fails the whole
/// batch.
pub fn decode_entries<T: DeserializeOwned>(
    context: &'static str,
    items: Vec<Value>,
) -> Result<Vec<Entry<T>>> {
    items
        .into_iter()
        .map(|item| {
            if looks_like_error(&item) {
                serde_json::from_value(item)
                    .map(Entry::Error)
                    .map_err(|e| EpgError::decode(context, e))
            } else {
                serde_json::from_value(item)
                    .map(Entry::Record)
                    .map_err(|e| EpgError::decode(context, e))
            }
        })
        .collect()
}

/// [`split_batch`] followed by [`decode_entries`]
pub fn decode_batch<T: DeserializeOwned>(context: &'static str, raw: &[u8]) -> Result<Vec<Entry<T>>> {
    decode_entries(context, split_batch(context, raw)?)
}
