use aliri_clock::UnixTime;

use crate::expiry;
use crate::{AccessToken, AccessTokenRef};

/// A bearer token together with the expiry instant derived from it
///
/// The expiry is decoded from the token's `exp` claim once, when the
/// credential is stored. A token carrying no decodable expiry yields a
/// credential that is always considered expired.
#[derive(Clone, Debug)]
pub struct Credential {
    access_token: AccessToken,
    expiry: Option<UnixTime>,
}

impl Credential {
    /// Derives a credential from a raw token
    pub fn from_token(access_token: AccessToken) -> Self {
        let expiry = expiry::decoded_expiry(&access_token);
        Self {
            access_token,
            expiry,
        }
    }

    /// The token itself
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The decoded expiry instant, if the token carried one
    #[inline]
    pub fn expiry(&self) -> Option<UnixTime> {
        self.expiry
    }

    /// Whether the credential is unusable as of `now`, fudge margin included
    #[inline]
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now + expiry::EXPIRE_FUDGE,
            None => true,
        }
    }
}
