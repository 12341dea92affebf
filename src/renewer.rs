//! The token-lifecycle manager
//!
//! Owns the cached credential and the renewal timer. Both the explicit
//! [`retrieve_token`][RenewableToken::retrieve_token] path and the
//! timer-triggered path run the same fetch-and-apply routine, so their
//! behavior cannot drift.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::backoff::RenewalBackoffConfig;
use crate::clock::{Clock, DurationSecs, System};
use crate::credential::Credential;
use crate::fetch::{self, ClientCredentials, TokenRequestError};
use crate::strings::{ClientId, ClientSecret};

/// Details of a failed automatic renewal attempt, delivered to the error hook
#[derive(Debug)]
pub struct RenewalFailure<'a> {
    /// The error produced by the failed fetch
    pub error: &'a TokenRequestError,

    /// Zero-based number of this attempt within the current renewal cycle
    pub attempt: u32,

    /// Delay until the next retry, or `None` when the cycle is stopping
    pub next_retry_in: Option<Duration>,
}

type ErrorHook = Arc<dyn Fn(RenewalFailure<'_>) + Send + Sync>;

/// Configuration for the renewal cycle
#[derive(Clone)]
pub struct RenewalConfig {
    safety_gap: DurationSecs,
    backoff: RenewalBackoffConfig,
    error_hook: Option<ErrorHook>,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            safety_gap: DEFAULT_SAFETY_GAP,
            backoff: RenewalBackoffConfig::default(),
            error_hook: None,
        }
    }
}

impl RenewalConfig {
    /// Constructs the default configuration: a 5 minute safety gap, default
    /// backoff, and no error hook
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lead time before expiry at which a renewal is scheduled
    ///
    /// Tokens whose lifetime does not exceed the gap renew at their half-life
    /// instead.
    pub fn with_safety_gap(mut self, gap: DurationSecs) -> Self {
        self.safety_gap = gap;
        self
    }

    /// Sets the retry policy applied when an automatic renewal fails
    pub fn with_backoff(mut self, backoff: RenewalBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Registers a hook invoked on every failed automatic renewal attempt
    ///
    /// Explicit fetches report their errors to the caller instead.
    pub fn with_error_hook(
        mut self,
        hook: impl Fn(RenewalFailure<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RenewalConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RenewalConfig")
            .field("safety_gap", &self.safety_gap)
            .field("backoff", &self.backoff)
            .field("error_hook", &self.error_hook.is_some())
            .finish()
    }
}

/// A process-wide, self-renewing cache for a client-credentials access token
///
/// A successful [`retrieve_token`][Self::retrieve_token] caches the parsed
/// credential and arms a timer that refreshes it in the background before it
/// expires, using the same endpoint and client identity. [`token`][Self::token]
/// reads the cached credential synchronously and never touches the network.
///
/// Handles are cheap to clone and share one cache. When the last handle is
/// dropped, the background cycle winds down on its own.
///
/// # Concurrency
///
/// At most one renewal timer is armed at any time; arming a new one cancels
/// the previous one first. An in-flight fetch is never cancelled by a newer
/// one: if two fetches race, the one that *completes* last determines the
/// cached credential and the armed renewal (last-write-wins by completion
/// order). The swap of credential and timer happens in a single critical
/// section, so readers never observe half-updated state.
pub struct RenewableToken<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RenewableToken<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for RenewableToken<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RenewableToken")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

struct Inner<C> {
    http: reqwest::Client,
    config: RenewalConfig,
    clock: C,
    state: Mutex<State>,
}

struct State {
    credential: Option<Arc<Credential>>,
    renewal: Option<Renewal>,
    next_renewal_id: u64,
}

struct Renewal {
    id: u64,
    handle: JoinHandle<()>,
}

/// The endpoint and client identity a renewal re-uses when it fires
struct RenewalContext {
    token_url: reqwest::Url,
    credentials: ClientCredentials,
}

impl RenewableToken {
    /// Constructs a cache with the default configuration, using the system
    /// clock
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_config(http, RenewalConfig::default())
    }

    /// Constructs a cache with the given configuration, using the system
    /// clock
    pub fn with_config(http: reqwest::Client, config: RenewalConfig) -> Self {
        Self::with_config_and_clock(http, config, System)
    }
}

impl<C> RenewableToken<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a cache using the given clock
    ///
    /// Useful for pinning credential issue times in tests.
    pub fn with_config_and_clock(http: reqwest::Client, config: RenewalConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                config,
                clock,
                state: Mutex::new(State {
                    credential: None,
                    renewal: None,
                    next_renewal_id: 0,
                }),
            }),
        }
    }

    /// Fetches a credential from the token endpoint and, on success, caches
    /// it and arms the next renewal
    ///
    /// This is also how the very first credential is obtained; there is no
    /// separate initialization step. `Ok(None)` means the authority answered
    /// with an empty body: the cached credential is cleared and nothing is
    /// armed. On error the cached credential is left untouched, but any
    /// pending renewal is disarmed; the caller decides whether to try again.
    pub async fn retrieve_token(
        &self,
        token_url: reqwest::Url,
        client_id: ClientId,
        client_secret: ClientSecret,
    ) -> Result<Option<Arc<Credential>>, TokenRequestError> {
        let ctx = Arc::new(RenewalContext {
            token_url,
            credentials: ClientCredentials {
                client_id,
                client_secret,
            },
        });

        match fetch::request_token(
            &self.inner.http,
            ctx.token_url.clone(),
            &ctx.credentials,
            &self.inner.clock,
        )
        .await
        {
            Ok(fetched) => Ok(Inner::apply_fetched(&self.inner, &ctx, fetched)),
            Err(error) => {
                self.inner.state.lock().disarm();
                Err(error)
            }
        }
    }
}

impl<C> RenewableToken<C> {
    /// Gets the cached credential, if any
    ///
    /// A pure read of shared state: never fetches, never blocks on I/O,
    /// never fails. `None` until the first successful fetch, or after the
    /// authority answered a fetch with no credential.
    pub fn token(&self) -> Option<Arc<Credential>> {
        self.inner.state.lock().credential.clone()
    }

    /// Whether a renewal is currently armed
    pub fn renewal_armed(&self) -> bool {
        self.inner.state.lock().renewal.is_some()
    }
}

impl<C> Inner<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Applies the outcome of a completed fetch: swaps the cached credential
    /// and re-arms the renewal in one critical section.
    fn apply_fetched(
        this: &Arc<Self>,
        ctx: &Arc<RenewalContext>,
        fetched: Option<Credential>,
    ) -> Option<Arc<Credential>> {
        let mut state = this.state.lock();
        state.disarm();
        match fetched {
            Some(credential) => {
                let credential = Arc::new(credential);
                state.credential = Some(Arc::clone(&credential));
                let delay = renewal_delay(credential.lifetime(), this.config.safety_gap);
                tracing::debug!(delay_ms = delay.as_millis() as u64, "arming next renewal");
                Self::arm(this, &mut state, ctx, delay, 0);
                Some(credential)
            }
            None => {
                tracing::debug!("authority issued no credential, nothing to renew");
                state.credential = None;
                None
            }
        }
    }

    /// Arms the renewal timer. The caller must already have disarmed any
    /// previous one.
    fn arm(
        this: &Arc<Self>,
        state: &mut State,
        ctx: &Arc<RenewalContext>,
        delay: Duration,
        attempt: u32,
    ) {
        let id = state.next_renewal_id;
        state.next_renewal_id += 1;
        let handle = tokio::spawn(renewal_task(
            Arc::downgrade(this),
            Arc::clone(ctx),
            delay,
            attempt,
            id,
        ));
        state.renewal = Some(Renewal { id, handle });
    }
}

impl State {
    fn disarm(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.handle.abort();
        }
    }

    /// Drops registration `id` without aborting it, reporting whether it was
    /// still the armed renewal. Called by the armed task itself as it fires.
    fn release(&mut self, id: u64) -> bool {
        if self.renewal.as_ref().is_some_and(|r| r.id == id) {
            self.renewal = None;
            true
        } else {
            false
        }
    }
}

/// Waits out the scheduled delay, then runs the same fetch-and-apply routine
/// as an explicit call, retrying with backoff on failure
async fn renewal_task<C>(
    inner: Weak<Inner<C>>,
    ctx: Arc<RenewalContext>,
    delay: Duration,
    attempt: u32,
    id: u64,
) where
    C: Clock + Send + Sync + 'static,
{
    tokio::time::sleep(delay).await;

    let Some(inner) = inner.upgrade() else {
        // all cache handles dropped
        return;
    };

    if !inner.state.lock().release(id) {
        // superseded between waking and locking
        return;
    }

    tracing::debug!(attempt, "renewing credential");
    match fetch::request_token(&inner.http, ctx.token_url.clone(), &ctx.credentials, &inner.clock)
        .await
    {
        Ok(fetched) => {
            Inner::apply_fetched(&inner, &ctx, fetched);
        }
        Err(error) => {
            let next_retry_in = inner.config.backoff.delay_for(attempt);
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                attempt,
                retry_in_ms = next_retry_in.map(|d| d.as_millis() as u64),
                "credential renewal failed"
            );
            if let Some(hook) = &inner.config.error_hook {
                hook(RenewalFailure {
                    error: &error,
                    attempt,
                    next_retry_in,
                });
            }
            match next_retry_in {
                Some(retry_delay) => {
                    let mut state = inner.state.lock();
                    // a concurrent explicit fetch may have re-armed already;
                    // its schedule wins
                    if state.renewal.is_none() {
                        Inner::arm(&inner, &mut state, &ctx, retry_delay, attempt + 1);
                    }
                }
                None => {
                    tracing::info!(
                        "renewal retries exhausted, auto-renewal stopped until the next \
                         explicit fetch"
                    );
                }
            }
        }
    }
}

const DEFAULT_SAFETY_GAP: DurationSecs = DurationSecs(5 * 60);

/// Delay before the next renewal
///
/// Tokens living longer than the safety gap renew one gap ahead of expiry;
/// shorter-lived tokens renew at their half-life so the delay stays positive.
fn renewal_delay(lifetime: DurationSecs, safety_gap: DurationSecs) -> Duration {
    let expires_ms = lifetime.0.saturating_mul(1_000);
    let gap_ms = safety_gap.0.saturating_mul(1_000);
    if expires_ms > gap_ms {
        Duration::from_millis(expires_ms - gap_ms)
    } else {
        Duration::from_millis(expires_ms / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::Value;

    const GAP: DurationSecs = DEFAULT_SAFETY_GAP;

    #[test]
    fn long_lived_token_renews_one_gap_before_expiry() {
        assert_eq!(
            renewal_delay(DurationSecs(3_600), GAP),
            Duration::from_millis(3_300_000)
        );
    }

    #[test]
    fn short_lived_token_renews_at_its_half_life() {
        assert_eq!(
            renewal_delay(DurationSecs(60), GAP),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn lifetime_equal_to_the_gap_takes_the_half_life_branch() {
        assert_eq!(
            renewal_delay(DurationSecs(300), GAP),
            Duration::from_millis(150_000)
        );
        assert_eq!(
            renewal_delay(DurationSecs(301), GAP),
            Duration::from_millis(1_000)
        );
    }

    fn new_cache(server: &MockServer) -> (RenewableToken, reqwest::Url) {
        let url = reqwest::Url::parse(&server.url("/token")).unwrap();
        (RenewableToken::new(reqwest::Client::new()), url)
    }

    fn client_id() -> ClientId {
        ClientId::from_static("test-client")
    }

    fn client_secret() -> ClientSecret {
        ClientSecret::from_static("test-secret")
    }

    #[tokio::test]
    async fn retrieve_caches_the_parsed_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-123","token_type":"Bearer","expires_in":3600,"scope":"read:things"}"#);
        });

        let (cache, url) = new_cache(&server);
        assert!(cache.token().is_none());

        let credential = cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(credential.access_token().unwrap().as_str(), "tok-123");
        assert_eq!(credential.token_type(), Some("Bearer"));
        assert_eq!(credential.lifetime(), DurationSecs(3_600));
        assert_eq!(
            credential.extra().get("scope"),
            Some(&Value::String("read:things".into()))
        );

        let cached = cache.token().unwrap();
        assert_eq!(cached.access_token().unwrap().as_str(), "tok-123");
        assert!(cache.renewal_armed());
        mock.assert();
    }

    #[tokio::test]
    async fn response_with_only_a_lifetime_is_still_cached() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"expires_in":3600}"#);
        });

        let (cache, url) = new_cache(&server);
        let credential = cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap()
            .unwrap();

        assert!(credential.access_token().is_none());
        assert_eq!(credential.lifetime(), DurationSecs(3_600));
        assert!(cache.token().is_some());
        assert!(cache.renewal_armed());
        mock.assert();
    }

    #[tokio::test]
    async fn request_uses_basic_auth_and_a_form_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header(
                    "authorization",
                    "Basic dGVzdC1jbGllbnQ6dGVzdC1zZWNyZXQ=",
                )
                .header("content-type", "application/x-www-form-urlencoded")
                .body("grant_type=client_credentials");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok","expires_in":3600}"#);
        });

        let (cache, url) = new_cache(&server);
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn grant_error_leaves_the_previous_credential_cached() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-old","expires_in":3600}"#);
        });
        let _mock = server.mock(|when, then| {
            when.method(POST).path("/denied");
            then.status(401);
        });

        let (cache, url) = new_cache(&server);
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();
        assert!(cache.renewal_armed());

        let denied = reqwest::Url::parse(&server.url("/denied")).unwrap();
        let err = cache
            .retrieve_token(denied, client_id(), client_secret())
            .await
            .unwrap_err();

        assert!(
            matches!(&err, TokenRequestError::Grant { status } if status.as_u16() == 401),
            "expected a grant error, got: {err}"
        );
        assert_eq!(cache.token().unwrap().access_token().unwrap().as_str(), "tok-old");
        assert!(!cache.renewal_armed());
    }

    #[tokio::test]
    async fn grant_error_without_prior_success_leaves_nothing_cached() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(500);
        });

        let (cache, url) = new_cache(&server);
        let err = cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap_err();

        assert!(matches!(err, TokenRequestError::Grant { status } if status.as_u16() == 500));
        assert!(cache.token().is_none());
        assert!(!cache.renewal_armed());
    }

    #[tokio::test]
    async fn empty_success_body_clears_the_credential_and_disarms() {
        let server = MockServer::start();
        let issued = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok","expires_in":1}"#);
        });
        let _mock = server.mock(|when, then| {
            when.method(POST).path("/empty");
            then.status(200);
        });

        let (cache, url) = new_cache(&server);
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();
        assert!(cache.renewal_armed());

        let empty = reqwest::Url::parse(&server.url("/empty")).unwrap();
        let absent = cache
            .retrieve_token(empty, client_id(), client_secret())
            .await
            .unwrap();

        assert!(absent.is_none());
        assert!(cache.token().is_none());
        assert!(!cache.renewal_armed());

        // the 500 ms renewal armed by the first fetch must not fire
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        issued.assert_calls(1);
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_error() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body("not json");
        });

        let (cache, url) = new_cache(&server);
        let err = cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap_err();

        assert!(matches!(err, TokenRequestError::Protocol(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let url = reqwest::Url::parse("http://127.0.0.1:9/token").unwrap();
        let cache = RenewableToken::new(reqwest::Client::new());

        let err = cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap_err();

        assert!(matches!(err, TokenRequestError::Transport(_)));
    }

    #[tokio::test]
    async fn renewal_fires_without_an_explicit_call() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok","expires_in":1}"#);
        });

        let (cache, url) = new_cache(&server);
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();

        // expires_in of 1 s renews at its 500 ms half-life
        tokio::time::sleep(Duration::from_millis(1_800)).await;

        assert!(mock.calls() >= 2, "expected an automatic renewal");
        assert!(cache.renewal_armed());
        assert!(cache.token().is_some());
    }

    #[tokio::test]
    async fn explicit_failure_disarms_the_pending_renewal() {
        let server = MockServer::start();
        let issued = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok","expires_in":1}"#);
        });
        let denied = server.mock(|when, then| {
            when.method(POST).path("/denied");
            then.status(500);
        });

        let (cache, url) = new_cache(&server);
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();
        assert!(cache.renewal_armed());

        let denied_url = reqwest::Url::parse(&server.url("/denied")).unwrap();
        cache
            .retrieve_token(denied_url, client_id(), client_secret())
            .await
            .unwrap_err();
        assert!(!cache.renewal_armed());

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        issued.assert_calls(1);
        denied.assert_calls(1);
    }

    #[tokio::test]
    async fn later_completing_fetch_determines_the_cached_credential() {
        let server = MockServer::start();
        let slow = server.mock(|when, then| {
            when.method(POST).path("/slow");
            then.status(200)
                .header("content-type", "application/json")
                .delay(Duration::from_millis(400))
                .body(r#"{"access_token":"tok-slow","expires_in":3600}"#);
        });
        let fast = server.mock(|when, then| {
            when.method(POST).path("/fast");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok-fast","expires_in":3600}"#);
        });

        let cache = RenewableToken::new(reqwest::Client::new());
        let slow_url = reqwest::Url::parse(&server.url("/slow")).unwrap();
        let fast_url = reqwest::Url::parse(&server.url("/fast")).unwrap();

        let (first, second) = tokio::join!(
            cache.retrieve_token(slow_url, client_id(), client_secret()),
            cache.retrieve_token(fast_url, client_id(), client_secret()),
        );
        first.unwrap();
        second.unwrap();

        // neither fetch was cancelled; the delayed one completed last, so
        // its credential is the one cached and its renewal is the one armed
        let cached = cache.token().unwrap();
        assert_eq!(cached.access_token().unwrap().as_str(), "tok-slow");
        assert!(cache.renewal_armed());
        slow.assert();
        fast.assert();
    }

    #[tokio::test]
    async fn failed_renewals_retry_with_backoff_then_stop() {
        let server = MockServer::start();
        let mut issued = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"tok","expires_in":1}"#);
        });

        let failures = Arc::new(Mutex::new(Vec::new()));
        let config = RenewalConfig::new()
            .with_backoff(RenewalBackoffConfig::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
                2,
                2,
            ))
            .with_error_hook({
                let failures = Arc::clone(&failures);
                move |failure: RenewalFailure<'_>| {
                    failures
                        .lock()
                        .push((failure.attempt, failure.next_retry_in.is_some()));
                }
            });
        let cache = RenewableToken::with_config(reqwest::Client::new(), config);

        let url = reqwest::Url::parse(&server.url("/token")).unwrap();
        cache
            .retrieve_token(url, client_id(), client_secret())
            .await
            .unwrap();

        issued.delete();
        let broken = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(500);
        });

        // renewal at 500 ms fails, retries after 100 ms and 200 ms, then stops
        tokio::time::sleep(Duration::from_secs(2)).await;

        broken.assert_calls(3);
        assert!(!cache.renewal_armed());
        assert_eq!(cache.token().unwrap().access_token().unwrap().as_str(), "tok");
        assert_eq!(&*failures.lock(), &[(0, true), (1, true), (2, false)]);
    }
}
