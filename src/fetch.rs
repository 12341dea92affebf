//! The client-credentials grant against the token endpoint

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::{Clock, DurationSecs};
use crate::credential::Credential;
use crate::strings::{AccessToken, ClientId, ClientSecret};

/// The client identity presented to the token endpoint via HTTP basic auth
#[derive(Clone, Debug)]
pub(crate) struct ClientCredentials {
    pub client_id: ClientId,
    pub client_secret: ClientSecret,
}

/// An error while attempting to obtain a credential from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The request could not be sent: DNS, connection, or TLS failure
    #[error("error sending token request to the authority")]
    Transport(#[source] reqwest::Error),

    /// The authority answered the grant with an error status
    #[error("authority rejected the token grant: status {status}")]
    Grant {
        /// The HTTP status code returned by the authority
        status: StatusCode,
    },

    /// The response carried a success status but its body could not be read
    #[error("error reading token response body")]
    BodyRead(#[source] reqwest::Error),

    /// The response body was not a valid JSON token response
    #[error("error deserializing token response body")]
    Protocol(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<AccessToken>,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: DurationSecs,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Performs a single client-credentials grant.
///
/// A success status with an empty body resolves to `Ok(None)`: the authority
/// answered, but issued no credential.
#[tracing::instrument(
    err,
    skip(http, token_url, credentials, clock),
    fields(token_url = %token_url, credentials.client_id = %credentials.client_id),
)]
pub(crate) async fn request_token<C: Clock>(
    http: &reqwest::Client,
    token_url: reqwest::Url,
    credentials: &ClientCredentials,
    clock: &C,
) -> Result<Option<Credential>, TokenRequestError> {
    tracing::trace!("requesting credential from authority");

    let resp = http
        .post(token_url)
        .basic_auth(
            credentials.client_id.as_str(),
            Some(credentials.client_secret.as_str()),
        )
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(TokenRequestError::Transport)?;

    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received response from token endpoint"
    );

    if status.as_u16() >= 400 {
        return Err(TokenRequestError::Grant { status });
    }

    let body = resp.bytes().await.map_err(TokenRequestError::BodyRead)?;
    if body.is_empty() {
        tracing::debug!("token endpoint answered with an empty body, no credential issued");
        return Ok(None);
    }

    let parsed: TokenResponse = serde_json::from_slice(&body)?;
    let credential = Credential::new(
        parsed.access_token,
        parsed.token_type,
        parsed.expires_in,
        clock.now(),
        parsed.extra,
    );

    tracing::info!(
        lifetime = credential.lifetime().0,
        expiry = credential.expiry().0,
        "received new credential"
    );

    Ok(Some(credential))
}
