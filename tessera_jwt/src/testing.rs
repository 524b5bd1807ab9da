//! Helpers for forging tokens in tests
//!
//! The forged tokens carry a placeholder signature. They are only useful
//! against code that does not verify signatures, which is exactly what the
//! rest of this crate is.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;
const SIGNATURE: &[u8] = b"not-a-real-signature";

/// Builds a structurally valid JWT carrying `claims` as its payload
pub fn forge_unsigned(claims: &serde_json::Value) -> String {
    let payload = claims.to_string();
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(HEADER),
        URL_SAFE_NO_PAD.encode(payload),
        URL_SAFE_NO_PAD.encode(SIGNATURE),
    )
}
