// src/connectors/signing.rs
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Request parameters in canonical (alphabetical) key order.
///
/// The exchange recomputes the signature over the exact string we sent, so
/// the order used for signing and for the wire must be the same.
pub type CanonicalParams = BTreeMap<String, Value>;

pub fn canonicalize(params: &[(&str, Value)]) -> CanonicalParams {
    params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn query_string(params: &CanonicalParams) -> Result<String, serde_urlencoded::ser::Error> {
    let pairs: Vec<(&str, String)> = params
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.as_str(), value)
        })
        .collect();
    serde_urlencoded::to_string(pairs)
}

/// JSON body with keys in alphabetical order.
pub fn json_body(params: &CanonicalParams) -> Result<String, serde_json::Error> {
    serde_json::to_string(params)
}

/// hex(HMAC_SHA256(secret, timestamp + api_key + recv_window + payload))
pub fn sign(
    secret: &str,
    timestamp: i64,
    api_key: &str,
    recv_window: u64,
    payload: &str,
) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(api_key.as_bytes());
    mac.update(recv_window.to_string().as_bytes());
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
