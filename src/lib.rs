//! Process-wide caching and background renewal of OAuth2 client-credentials
//! access tokens
//!
//! Server processes that present a bearer token to a downstream service
//! cannot afford a token fetch on every request, nor a stampede of refreshes
//! when the token expires. This crate keeps exactly one credential per cache,
//! fetched with the client-credentials grant, and refreshes it in the
//! background ahead of expiry so that readers always get an answer
//! synchronously.
//!
//! # General flow
//!
//! Construct a [`RenewableToken`] once, with the `reqwest` client your host
//! process already configures (timeouts included), and hand out clones to
//! anything that needs a token. The first
//! [`retrieve_token`][RenewableToken::retrieve_token] obtains the initial
//! credential and arms the renewal cycle; from then on,
//! [`token`][RenewableToken::token] reads the freshest credential without
//! ever blocking on the network.
//!
//! Renewal is scheduled a safety gap (five minutes by default) ahead of the
//! declared expiry, or at the token's half-life when its whole lifetime is
//! shorter than the gap. A failed renewal is retried with bounded exponential
//! backoff and reported through an optional error hook; once the retry budget
//! is exhausted, the cycle stops and the last good credential stays cached
//! until the next explicit fetch.
//!
//! ```no_run
//! use renewable_tokens::{ClientId, ClientSecret, RenewableToken};
//!
//! # async fn example() -> Result<(), renewable_tokens::TokenRequestError> {
//! let cache = RenewableToken::new(reqwest::Client::new());
//!
//! let credential = cache
//!     .retrieve_token(
//!         reqwest::Url::parse("https://example.com/oauth/token").unwrap(),
//!         ClientId::from_static("my-service"),
//!         ClientSecret::from_static("my-secret"),
//!     )
//!     .await?;
//!
//! if let Some(credential) = credential {
//!     tracing::info!(
//!         token = format_args!("{:#?}", credential.access_token()),
//!         "first credential"
//!     );
//! }
//!
//! // later, on any clone of the cache, with no network round trip:
//! let current = cache.token();
//! # Ok(())
//! # }
//! ```
//!
//! A runnable version of this flow lives in `demos/periodic_refresh.rs`.

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

pub mod backoff;
pub mod clock;
mod credential;
mod fetch;
mod renewer;
mod strings;

pub use credential::Credential;
pub use fetch::TokenRequestError;
pub use renewer::{RenewableToken, RenewalConfig, RenewalFailure};
pub use strings::*;
