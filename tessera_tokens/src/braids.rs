use aliri_braid::braid;
use std::fmt;

/// Secrets print as a placeholder. `{:#?}` reveals a bounded prefix, a width
/// (`{:#8?}`) sets how many characters, and `{:#}` reveals the whole value.
macro_rules! redacted {
    ($ty:ty: $label:literal, $prefix:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(&self.0, &mut *f, $prefix)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }
    };
}

fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, default_chars: usize) -> fmt::Result {
    let shown = f.width().unwrap_or(default_chars);
    if shown == 0 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(shown) {
        Some((cut, _)) => {
            f.write_str(&secret[..cut])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// The OAuth client identifier registered with the identity provider
#[braid(serde)]
pub struct ClientId;

/// A bearer credential presented to protected endpoints
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 12);

/// An OIDC ID token, carrying the signed-in user's identity claims
#[braid(serde)]
pub struct IdToken;

/// A long-lived credential used to obtain new access and ID tokens
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN", 4);

/// A single-use code issued by the identity provider at the end of the
/// authorization redirect
#[braid(serde, debug = "owned", display = "owned")]
pub struct AuthorizationCode;

redacted!(AuthorizationCodeRef: "AUTHORIZATION CODE", 4);
