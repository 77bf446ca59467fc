//! Collaborator seams for the external authentication system
//!
//! The session coordinator performs no network I/O of its own. Establishing,
//! renewing, and terminating a session are delegated to a [`TokenAuthority`]
//! implementation supplied by the host application, and authentication-state
//! transitions are reported to an [`AuthStateObserver`].

use async_trait::async_trait;
use thiserror::Error;

use crate::AccessToken;

/// An error reported by the external token authority
///
/// Carries the status code the authority responded with, when there was one.
/// The session coordinator uses the status to decide whether a refresh
/// failure means the credential was rejected outright or the attempt merely
/// failed.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct AuthorityError {
    status: Option<u16>,
    message: String,
}

impl AuthorityError {
    /// An error with no associated status code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// An error carrying the status code the authority responded with
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// The status code, if the authority produced one
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The underlying message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The external authority that establishes, renews, and terminates sessions
///
/// Implementations perform the actual authentication calls and any
/// credential persistence or user notification the host application wants.
/// The coordinator guarantees that [`refresh`][TokenAuthority::refresh] is
/// never invoked concurrently with itself: however many requests find the
/// credential expired at once, one refresh call settles them all.
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    /// Data forwarded to the authority when establishing a session
    type Credentials: Send + 'static;

    /// Exchanges login credentials for a bearer token
    async fn login(&self, credentials: Self::Credentials) -> Result<AccessToken, AuthorityError>;

    /// Terminates the session on the authority's side
    async fn logout(&self) -> Result<(), AuthorityError>;

    /// Renews the bearer token
    async fn refresh(&self) -> Result<AccessToken, AuthorityError>;
}

/// Observer notified when the session gains or loses its credential
pub trait AuthStateObserver: Send + Sync {
    /// Called with the new state on every authenticated/unauthenticated
    /// transition
    fn auth_state_changed(&self, authenticated: bool);
}

impl<F> AuthStateObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn auth_state_changed(&self, authenticated: bool) {
        self(authenticated)
    }
}

/// The do-nothing observer
impl AuthStateObserver for () {
    fn auth_state_changed(&self, _: bool) {}
}

/// An authority that always produces the same token
///
/// Logins ignore their credentials and refreshes always succeed. Useful as a
/// stand-in when exercising a middleware stack in tests and examples.
#[derive(Clone, Debug)]
pub struct ConstTokenAuthority {
    token: AccessToken,
}

impl ConstTokenAuthority {
    /// Constructs an authority that always yields `token`
    pub fn new(token: impl Into<AccessToken>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenAuthority for ConstTokenAuthority {
    type Credentials = ();

    async fn login(&self, _credentials: ()) -> Result<AccessToken, AuthorityError> {
        Ok(self.token.clone())
    }

    async fn logout(&self) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<AccessToken, AuthorityError> {
        Ok(self.token.clone())
    }
}
