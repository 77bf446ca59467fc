//! Session state and the single-flight refresh coordinator
//!
//! All shared state (the held credential, the `refreshing` flag, and the
//! pending queue) lives behind one lock, and every mutation flows through
//! this module. The lock is never held across an await point: the decision
//! to refresh, wait, or proceed is made in a single critical section, and
//! the queue drains in the same critical section that clears the flag.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use aliri_clock::{Clock, System};
use tokio::sync::oneshot;

use crate::authority::{AuthStateObserver, AuthorityError, TokenAuthority};
use crate::credential::Credential;
use crate::queue::{PendingQueue, Settlement};
use crate::{AccessToken, AccessTokenRef, RefreshError};

const DEFAULT_HEADER: &str = "Authorization";

type HeaderFormatter = Box<dyn Fn(&AccessTokenRef) -> String + Send + Sync>;

fn bearer_format(token: &AccessTokenRef) -> String {
    format!("Bearer {}", token.as_str())
}

/// How the credential is rendered onto outgoing requests
struct HeaderConfig {
    name: String,
    format: HeaderFormatter,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_HEADER.into(),
            format: Box::new(bearer_format),
        }
    }
}

impl fmt::Debug for HeaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeaderConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Mutable session state; every field is guarded by the one lock in
/// [`SessionInner`].
#[derive(Debug, Default)]
struct SessionState {
    credential: Option<Credential>,
    refreshing: bool,
    queue: PendingQueue,
}

struct SessionInner<A, C> {
    authority: A,
    observer: Box<dyn AuthStateObserver>,
    header: HeaderConfig,
    clock: C,
    state: Mutex<SessionState>,
}

/// Configures and initializes a [`Session`]
pub struct SessionBuilder<A, C = System> {
    authority: A,
    observer: Box<dyn AuthStateObserver>,
    header: HeaderConfig,
    clock: C,
}

impl<A> SessionBuilder<A, System>
where
    A: TokenAuthority,
{
    /// Starts configuring a session backed by `authority`
    pub fn new(authority: A) -> Self {
        Self {
            authority,
            observer: Box::new(()),
            header: HeaderConfig::default(),
            clock: System,
        }
    }
}

impl<A, C> SessionBuilder<A, C> {
    /// Registers an observer for authentication-state transitions
    pub fn with_observer(mut self, observer: impl AuthStateObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Overrides the name of the header the credential is attached under
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header.name = name.into();
        self
    }

    /// Overrides how the header value is rendered from the token
    ///
    /// The default renders `Bearer <token>`.
    pub fn with_header_format<F>(mut self, format: F) -> Self
    where
        F: Fn(&AccessTokenRef) -> String + Send + Sync + 'static,
    {
        self.header.format = Box::new(format);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SessionBuilder<A, D> {
        SessionBuilder {
            authority: self.authority,
            observer: self.observer,
            header: self.header,
            clock,
        }
    }
}

impl<A, C> SessionBuilder<A, C>
where
    A: TokenAuthority,
    C: Clock + Send + Sync,
{
    /// Performs the best-effort initial refresh and hands back the session
    ///
    /// The initial attempt is silent: there is no caller to report to yet,
    /// so a failure is logged and the session simply starts unauthenticated.
    /// The authentication-state signal is emitted either way. Transport
    /// middleware can only be installed from the returned session, which
    /// keeps the first real request from racing this initial attempt.
    pub async fn start(self) -> Session<A, C> {
        let session = Session {
            inner: Arc::new(SessionInner {
                authority: self.authority,
                observer: self.observer,
                header: self.header,
                clock: self.clock,
                state: Mutex::default(),
            }),
        };

        if let Err(error) = session.valid_token().await {
            tracing::warn!(%error, "initial token refresh failed; session starts unauthenticated");
        }

        session.emit_state();
        session
    }
}

impl<A, C> fmt::Debug for SessionBuilder<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Handle to a shared authenticated session
///
/// Cheap to clone; every clone coordinates through the same state, so a
/// session handed to transport middleware and one kept for `login`/`logout`
/// stay consistent.
pub struct Session<A, C = System> {
    inner: Arc<SessionInner<A, C>>,
}

impl<A, C> Clone for Session<A, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, C> fmt::Debug for Session<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Session")
            .field("authenticated", &state.credential.is_some())
            .field("refreshing", &state.refreshing)
            .field("pending", &state.queue.len())
            .finish_non_exhaustive()
    }
}

/// What a caller must do after the admission decision
enum Admission {
    /// The held credential is usable as-is
    Fresh(AccessToken),
    /// A refresh is in flight; wait for its settlement
    Wait(oneshot::Receiver<Settlement>),
    /// This caller performs the refresh
    Refresh,
}

impl<A, C> Session<A, C> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().expect("session state lock poisoned")
    }

    fn emit_state(&self) {
        let authenticated = self.is_authenticated();
        self.inner.observer.auth_state_changed(authenticated);
    }

    /// Whether a credential is currently held
    ///
    /// Presence only: the credential may already be expired, in which case
    /// the next request renews it.
    pub fn is_authenticated(&self) -> bool {
        self.lock_state().credential.is_some()
    }

    /// The name of the header credentials are attached under
    pub fn header_name(&self) -> &str {
        &self.inner.header.name
    }

    /// The header value for the currently held credential, if any
    pub fn authorization_value(&self) -> Option<String> {
        let state = self.lock_state();
        state
            .credential
            .as_ref()
            .map(|credential| (self.inner.header.format)(credential.access_token()))
    }

    /// Renders `token` the way it would be attached to a request
    pub fn format_token(&self, token: &AccessTokenRef) -> String {
        (self.inner.header.format)(token)
    }
}

impl<A, C> Session<A, C>
where
    A: TokenAuthority,
    C: Clock + Send + Sync,
{
    /// Returns a token that was valid at the time of the call
    ///
    /// If the held credential is missing or expired, a refresh runs; any
    /// call arriving while that refresh is outstanding parks on the pending
    /// queue and settles from the same outcome. At most one refresh is ever
    /// in flight.
    pub async fn valid_token(&self) -> Result<AccessToken, RefreshError> {
        let admission = {
            let mut state = self.lock_state();
            if state.refreshing {
                Admission::Wait(state.queue.enqueue())
            } else {
                match &state.credential {
                    Some(credential) if !credential.is_expired_at(self.inner.clock.now()) => {
                        Admission::Fresh(credential.access_token().to_owned())
                    }
                    _ => {
                        // The flag flips in the same critical section that
                        // decided a refresh is needed, so every caller
                        // admitted after this point parks on the queue.
                        state.refreshing = true;
                        Admission::Refresh
                    }
                }
            }
        };

        match admission {
            Admission::Fresh(token) => Ok(token),
            Admission::Wait(waiter) => match waiter.await {
                Ok(settlement) => settlement,
                Err(_) => Err(RefreshError::interrupted()),
            },
            Admission::Refresh => self.run_refresh().await,
        }
    }

    /// Performs the single in-flight refresh and settles the queue
    async fn run_refresh(&self) -> Result<AccessToken, RefreshError> {
        tracing::debug!("requesting refreshed token from authority");

        // The guard clears `refreshing` and fails the queue if this future
        // is dropped mid-flight; waiters are never left wedged.
        let guard = SettleOnDrop::new(&self.inner.state);
        let outcome = self.inner.authority.refresh().await;
        guard.settle(outcome)
    }

    /// Establishes a session via the authority's login call
    ///
    /// Bypasses the refresh queue entirely: the returned credential is
    /// stored directly and the authentication-state signal fires.
    pub async fn login(&self, credentials: A::Credentials) -> Result<(), AuthorityError> {
        let token = self.inner.authority.login(credentials).await?;
        {
            let mut state = self.lock_state();
            state.credential = Some(Credential::from_token(token));
        }
        tracing::debug!("login succeeded");
        self.emit_state();
        Ok(())
    }

    /// Terminates the session
    ///
    /// The credential is cleared and the authentication-state signal fires.
    /// A later request will attempt a refresh through the authority.
    pub async fn logout(&self) -> Result<(), AuthorityError> {
        self.inner.authority.logout().await?;
        {
            let mut state = self.lock_state();
            state.credential = None;
        }
        tracing::debug!("logout succeeded");
        self.emit_state();
        Ok(())
    }
}

/// Settles the refresh cycle exactly once
///
/// [`settle`][Self::settle] consumes the guard with the authority's outcome;
/// dropping it unsettled (the refresh future was cancelled) clears the flag
/// and fails every waiter instead. Either way `refreshing` cannot survive
/// the cycle.
struct SettleOnDrop<'a> {
    state: &'a Mutex<SessionState>,
    armed: bool,
}

impl<'a> SettleOnDrop<'a> {
    fn new(state: &'a Mutex<SessionState>) -> Self {
        Self { state, armed: true }
    }

    fn settle(
        mut self,
        outcome: Result<AccessToken, AuthorityError>,
    ) -> Result<AccessToken, RefreshError> {
        self.armed = false;
        let mut state = self.state.lock().expect("session state lock poisoned");
        state.refreshing = false;

        match outcome {
            Ok(token) => {
                let released = state.queue.len();
                state.credential = Some(Credential::from_token(token.clone()));
                state.queue.release_all(&token);
                tracing::debug!(released, "token refresh succeeded");
                Ok(token)
            }
            Err(error) => {
                let error = RefreshError::from(error);
                let failed = state.queue.len();
                state.queue.fail_all(&error);
                tracing::warn!(%error, failed, "token refresh failed");
                Err(error)
            }
        }
    }
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().expect("session state lock poisoned");
        state.refreshing = false;
        state.queue.fail_all(&RefreshError::interrupted());
    }
}
