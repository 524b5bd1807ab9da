use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tessera_clock::{Clock, UnixTime};

/// Claims read from a JWT payload **without** any signature verification
///
/// Suitable for display and for deciding whether a token is worth using.
/// Not suitable for authorization decisions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnverifiedClaims {
    #[serde(default, with = "numeric_date", skip_serializing_if = "Option::is_none")]
    exp: Option<UnixTime>,
    #[serde(default, with = "numeric_date", skip_serializing_if = "Option::is_none")]
    iat: Option<UnixTime>,
    #[serde(default, with = "numeric_date", skip_serializing_if = "Option::is_none")]
    nbf: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(default, with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    aud: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

impl UnverifiedClaims {
    /// The `exp` claim
    #[inline]
    pub fn expiration(&self) -> Option<UnixTime> {
        self.exp
    }

    /// The `iat` claim
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.iat
    }

    /// The `nbf` claim
    #[inline]
    pub fn not_before(&self) -> Option<UnixTime> {
        self.nbf
    }

    /// The `iss` claim
    #[inline]
    pub fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }

    /// The `sub` claim
    #[inline]
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// The `aud` claim, whether it was sent as a single string or a list
    #[inline]
    pub fn audiences(&self) -> &[String] {
        &self.aud
    }

    /// The OIDC `email` claim
    #[inline]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The OIDC `email_verified` claim
    #[inline]
    pub fn email_verified(&self) -> Option<bool> {
        self.email_verified
    }

    /// The OIDC `name` claim
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The OIDC `given_name` claim
    #[inline]
    pub fn given_name(&self) -> Option<&str> {
        self.given_name.as_deref()
    }

    /// The OIDC `family_name` claim
    #[inline]
    pub fn family_name(&self) -> Option<&str> {
        self.family_name.as_deref()
    }

    /// The OIDC `picture` claim
    #[inline]
    pub fn picture(&self) -> Option<&str> {
        self.picture.as_deref()
    }

    /// Any claim without a dedicated accessor, by name
    pub fn get(&self, claim: &str) -> Option<&Value> {
        self.other.get(claim)
    }

    /// Whether the claimed expiry has passed as of `now`
    ///
    /// A token without an `exp` claim is treated as expired.
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        self.exp.map_or(true, |exp| exp <= now)
    }

    /// Whether the claimed expiry has passed according to `clock`
    pub fn is_expired_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.is_expired_at(clock.now())
    }
}

/// NumericDate per RFC 7519: seconds since the epoch, possibly fractional
pub(crate) mod numeric_date {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
    use tessera_clock::UnixTime;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Whole(u64),
        Fractional(f64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<UnixTime>, D::Error> {
        match Option::<Numeric>::deserialize(d)? {
            None => Ok(None),
            Some(Numeric::Whole(secs)) => Ok(Some(UnixTime(secs))),
            Some(Numeric::Fractional(secs)) if secs.is_finite() && secs >= 0.0 => {
                Ok(Some(UnixTime(secs.floor() as u64)))
            }
            Some(Numeric::Fractional(_)) => Err(de::Error::custom("NumericDate out of range")),
        }
    }

    pub fn serialize<S: Serializer>(t: &Option<UnixTime>, s: S) -> Result<S::Ok, S::Error> {
        t.serialize(s)
    }
}

/// `aud` may be a single string or an array of strings
mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Option::<OneOrMany>::deserialize(d)? {
            None => Vec::new(),
            Some(OneOrMany::One(one)) => vec![one],
            Some(OneOrMany::Many(many)) => many,
        })
    }

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(aud: &Vec<String>, s: S) -> Result<S::Ok, S::Error> {
        match aud.as_slice() {
            [one] => one.serialize(s),
            many => many.serialize(s),
        }
    }
}

/// Some identity providers send `email_verified` as `"true"`/`"false"`
mod lenient_bool {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match Option::<BoolOrString>::deserialize(d)? {
            None => Ok(None),
            Some(BoolOrString::Bool(b)) => Ok(Some(b)),
            Some(BoolOrString::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(BoolOrString::String(s)) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(BoolOrString::String(s)) => Err(de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a boolean",
            )),
        }
    }

    pub fn serialize<S: Serializer>(b: &Option<bool>, s: S) -> Result<S::Ok, S::Error> {
        b.serialize(s)
    }
}
