use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{de::DeserializeOwned, Deserialize};
use tessera_clock::{Clock, System, UnixTime};
use thiserror::Error;

use crate::{claims::numeric_date, UnverifiedClaims};

/// base64url as JWTs use it; some issuers pad anyway, so padding is tolerated
const JWT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The token could not be read as a JWT
///
/// Callers should treat a token that fails to decode as unusable, not as a
/// fatal condition.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The token is not three `.`-separated segments with a non-empty header
    /// and payload
    #[error("malformed JWT: expected header, payload, and signature segments")]
    Malformed,

    /// The payload segment is not valid base64url
    #[error("malformed JWT payload encoding")]
    Base64(#[from] base64::DecodeError),

    /// The payload is not JSON of the expected shape
    #[error("malformed JWT payload")]
    Payload(#[source] serde_json::Error),
}

fn payload_segment(token: &str) -> Result<&str, DecodeError> {
    let mut segments = token.split('.');
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(header), Some(payload), Some(_signature), None)
            if !header.is_empty() && !payload.is_empty() =>
        {
            Ok(payload)
        }
        _ => Err(DecodeError::Malformed),
    }
}

/// Decodes the payload of a JWT into any deserializable type
///
/// **The signature is not checked.** See the [crate docs][crate].
///
/// # Errors
///
/// Returns an error if the token is not structurally a JWT, if the payload
/// is not base64url, or if the payload does not deserialize into `T`.
pub fn decode_payload<T: DeserializeOwned>(token: &str) -> Result<T, DecodeError> {
    let encoded = payload_segment(token)?;
    let raw = JWT_BASE64.decode(encoded)?;
    serde_json::from_slice(&raw).map_err(DecodeError::Payload)
}

/// Decodes the claims of a JWT without verifying it
///
/// # Errors
///
/// Returns an error if the token is malformed or its payload is not a JSON
/// object.
pub fn decode_unverified(token: &str) -> Result<UnverifiedClaims, DecodeError> {
    decode_payload(token)
}

#[derive(Deserialize)]
struct ExpiryOnly {
    #[serde(default, with = "numeric_date")]
    exp: Option<UnixTime>,
}

/// Whether the token claims an expiry that is still in the future, as of the
/// system clock
///
/// Returns `false` for any token that cannot be decoded or that carries no
/// `exp` claim. This never verifies the token.
pub fn is_valid(token: &str) -> bool {
    is_valid_with_clock(token, &System)
}

/// Whether the token claims an expiry that is still in the future, as of the
/// time reported by `clock`
pub fn is_valid_with_clock<C: Clock + ?Sized>(token: &str, clock: &C) -> bool {
    is_valid_at(token, clock.now())
}

/// Whether the token claims an expiry later than `now`
pub fn is_valid_at(token: &str, now: UnixTime) -> bool {
    match decode_payload::<ExpiryOnly>(token) {
        Ok(ExpiryOnly { exp: Some(exp) }) => exp > now,
        Ok(ExpiryOnly { exp: None }) | Err(_) => false,
    }
}
