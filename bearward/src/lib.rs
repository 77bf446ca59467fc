//! Session token lifecycle coordination for HTTP clients
//!
//! This library sits between an application and its HTTP transport and
//! guarantees that every outgoing request carries a valid bearer credential.
//! When the held credential is missing or expired, a renewal runs against an
//! external authority, and no matter how many requests discover the expiry
//! at the same moment, exactly one renewal call is made. Requests arriving
//! while that renewal is in flight park on a queue and settle transparently
//! from the single outcome: with the fresh token on success, or with the
//! same classified error on failure.
//!
//! The library performs no network I/O of its own. Logging in, logging out,
//! and renewing tokens are delegated to a [`TokenAuthority`] implementation
//! supplied by the host application, and transitions between authenticated
//! and unauthenticated are pushed to an [`AuthStateObserver`].
//!
//! # General flow
//!
//! Configure a session with your authority, then hand it to the transport
//! integration (for reqwest, see the companion `bearward_reqwest` crate):
//!
//! ```
//! use bearward::{ConstTokenAuthority, SessionBuilder};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let session = SessionBuilder::new(ConstTokenAuthority::new("demo-token"))
//!     .with_observer(|authenticated: bool| {
//!         tracing::info!(authenticated, "session state changed");
//!     })
//!     .start()
//!     .await;
//!
//! assert!(session.is_authenticated());
//!
//! let token = session.valid_token().await.unwrap();
//! assert_eq!(token.as_str(), "demo-token");
//! # }
//! ```
//!
//! Initialization is best-effort: a failed initial renewal leaves the
//! session unauthenticated rather than returning an error, and the first
//! request simply triggers a new attempt. Explicit [`login`][Session::login]
//! and [`logout`][Session::logout] bypass the renewal queue and mutate the
//! credential directly.
//!
//! A token is considered expired slightly before the instant in its `exp`
//! claim (see [`EXPIRE_FUDGE`]), so a token that passes the check still has
//! enough life left to survive the request it is attached to.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
mod braids;
mod credential;
mod error;
pub mod expiry;
mod queue;
mod session;

pub use authority::{AuthStateObserver, AuthorityError, ConstTokenAuthority, TokenAuthority};
pub use braids::*;
pub use credential::Credential;
pub use error::RefreshError;
pub use expiry::{is_token_expired, EXPIRE_FUDGE};
pub use session::{Session, SessionBuilder};
