//! The cached credential and its derived lifetime information

use serde_json::{Map, Value};

use crate::clock::{Clock, DurationSecs, System, UnixTime};
use crate::strings::{AccessToken, AccessTokenRef};

/// A credential as returned by the authority, with its expiry derived from
/// the time it was fetched
///
/// Only `expires_in` is required of the authority; a response may omit the
/// access token itself and still be cached for its lifetime information.
/// Beyond the fields this crate interprets, the token response is kept
/// verbatim: any additional JSON members are available through
/// [`extra`][Self::extra].
#[derive(Clone, Debug)]
pub struct Credential {
    access_token: Option<AccessToken>,
    token_type: Option<String>,
    expires_in: DurationSecs,
    issued: UnixTime,
    expiry: UnixTime,
    extra: Map<String, Value>,
}

impl Credential {
    pub(crate) fn new(
        access_token: Option<AccessToken>,
        token_type: Option<String>,
        expires_in: DurationSecs,
        issued: UnixTime,
        extra: Map<String, Value>,
    ) -> Self {
        Self {
            access_token,
            token_type,
            expires_in,
            issued,
            expiry: issued + expires_in,
            extra,
        }
    }

    /// Gets the access token, if the authority issued one
    #[inline]
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    /// Gets the token type declared by the authority, if any
    #[inline]
    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    /// Gets the lifetime declared by the authority (`expires_in`)
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.expires_in
    }

    /// Gets the time that the credential was fetched
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time that the credential will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the token response members not otherwise interpreted by this
    /// crate, keyed by their JSON member names
    #[inline]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Whether the credential has expired according to the system clock
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(System.now())
    }

    /// Whether the credential would be expired as of the provided time
    #[inline]
    pub fn is_expired_at(&self, time: UnixTime) -> bool {
        self.expiry <= time
    }

    /// Gets a duration for how much longer the credential would be valid as
    /// of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        if time < self.expiry {
            self.expiry - time
        } else {
            DurationSecs(0)
        }
    }
}
