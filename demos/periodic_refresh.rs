use clap::Parser;
use renewable_tokens::{ClientId, ClientSecret, RenewableToken};
use std::time::Duration;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID presented to the authority
    #[arg(short, long, env)]
    client_id: String,

    /// The client secret presented to the authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let cache = RenewableToken::new(client);

    let credential = cache
        .retrieve_token(
            opts.token_url,
            ClientId::from(opts.client_id),
            ClientSecret::from(opts.client_secret),
        )
        .await?;

    tracing::info!(
        credential = format_args!("{credential:#?}"),
        "first credential"
    );

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        match cache.token() {
            Some(credential) if !credential.is_expired() => {
                tracing::debug!(
                    expiry = credential.expiry().0,
                    renewal_armed = cache.renewal_armed(),
                    "credential fresh"
                );
            }
            Some(credential) => {
                tracing::warn!(
                    expiry = credential.expiry().0,
                    renewal_armed = cache.renewal_armed(),
                    "credential expired"
                );
            }
            None => {
                tracing::error!("no credential cached");
            }
        }
    }
}
