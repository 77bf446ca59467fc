//! Token expiry evaluation
//!
//! A token is usable until it comes within [`EXPIRE_FUDGE`] of the expiry
//! instant embedded in its `exp` claim. Tokens that carry no decodable claim
//! are treated as already expired, so an undecodable token can never be
//! attached to a request.

use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

use crate::AccessTokenRef;

/// Safety margin subtracted from a token's remaining lifetime before it is
/// considered usable, absorbing clock skew and in-flight request latency
pub const EXPIRE_FUDGE: DurationSecs = DurationSecs(10);

#[derive(Deserialize)]
struct ExpiryClaim {
    #[serde(default)]
    exp: Option<u64>,
}

/// Extracts the expiry instant from a token in compact JWS form
///
/// Returns `None` when the token is not in compact form, the claims segment
/// does not decode, or no `exp` claim is present. Callers treat `None` as
/// expired.
pub fn decoded_expiry(token: &AccessTokenRef) -> Option<UnixTime> {
    let mut segments = token.as_str().split('.');
    let _header = segments.next()?;
    let claims = segments.next()?;
    let payload = URL_SAFE_NO_PAD.decode(claims).ok()?;
    let decoded: ExpiryClaim = serde_json::from_slice(&payload).ok()?;
    decoded.exp.map(UnixTime)
}

/// Whether the token is absent, undecodable, or within [`EXPIRE_FUDGE`] of
/// its expiry
///
/// Usable standalone; the session coordinator applies the same check to the
/// credential it holds.
pub fn is_token_expired(token: Option<&AccessTokenRef>) -> bool {
    is_token_expired_at(token, System.now())
}

/// [`is_token_expired`] evaluated against an explicit current time
pub fn is_token_expired_at(token: Option<&AccessTokenRef>, now: UnixTime) -> bool {
    let Some(token) = token else {
        return true;
    };
    match decoded_expiry(token) {
        Some(expiry) => expiry <= now + EXPIRE_FUDGE,
        None => true,
    }
}

/// Builds an unsigned compact-form token carrying only an `exp` claim
#[cfg(test)]
pub(crate) fn unsigned_token_with_exp(exp: u64) -> crate::AccessToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    crate::AccessToken::new(format!("{header}.{claims}.sig"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccessToken;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn token_with_claims(claims: &str) -> AccessToken {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims);
        AccessToken::new(format!("{header}.{payload}.sig"))
    }

    #[test]
    fn absent_token_is_expired() {
        assert!(is_token_expired_at(None, NOW));
    }

    #[test]
    fn token_without_claim_segments_is_expired() {
        let token = AccessToken::from_static("not-a-jwt");
        assert!(is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn token_with_undecodable_claims_is_expired() {
        let token = AccessToken::from_static("aGVhZGVy.!!!not-base64!!!.sig");
        assert!(is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn token_without_exp_claim_is_expired() {
        let token = token_with_claims(r#"{"sub":"someone"}"#);
        assert!(decoded_expiry(&token).is_none());
        assert!(is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn expiry_claim_is_decoded() {
        let token = unsigned_token_with_exp(NOW.0 + 3600);
        assert_eq!(decoded_expiry(&token), Some(UnixTime(NOW.0 + 3600)));
    }

    #[test]
    fn token_expiring_in_the_past_is_expired() {
        let token = unsigned_token_with_exp(NOW.0 - 3600);
        assert!(is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn token_expiring_far_in_the_future_is_not_expired() {
        let token = unsigned_token_with_exp(NOW.0 + 3600);
        assert!(!is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn token_within_the_fudge_margin_is_expired() {
        let token = unsigned_token_with_exp(NOW.0 + EXPIRE_FUDGE.0);
        assert!(is_token_expired_at(Some(&token), NOW));
    }

    #[test]
    fn token_just_past_the_fudge_margin_is_not_expired() {
        let token = unsigned_token_with_exp(NOW.0 + EXPIRE_FUDGE.0 + 1);
        assert!(!is_token_expired_at(Some(&token), NOW));
    }
}
