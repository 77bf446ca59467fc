use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bearward::{AccessToken, AuthorityError, SessionBuilder, TokenAuthority};
use bearward_reqwest::SessionAuthMiddleware;
use clap::Parser;
use reqwest_middleware::ClientBuilder;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// Target for the periodic requests
    #[arg(short, long, env, default_value = "https://httpbin.org/bearer")]
    url: reqwest::Url,

    /// Seconds each minted token lives
    #[arg(short, long, env, default_value_t = 30)]
    lifetime: u64,

    /// Seconds between requests
    #[arg(short, long, env, default_value_t = 5)]
    period: u64,
}

/// Mints short-lived unsigned tokens locally instead of calling out to a
/// real authority, so the demo runs without any credentials. Watch the debug
/// logs: requests inside a token's lifetime reuse it, and the first request
/// past expiry triggers exactly one renewal.
#[derive(Debug)]
struct MintingAuthority {
    lifetime: u64,
}

impl MintingAuthority {
    fn mint(&self) -> AccessToken {
        let exp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_secs()
            + self.lifetime;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        AccessToken::new(format!("{header}.{claims}."))
    }
}

#[async_trait]
impl TokenAuthority for MintingAuthority {
    type Credentials = ();

    async fn login(&self, _credentials: ()) -> Result<AccessToken, AuthorityError> {
        Ok(self.mint())
    }

    async fn logout(&self) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<AccessToken, AuthorityError> {
        Ok(self.mint())
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let session = SessionBuilder::new(MintingAuthority {
        lifetime: opts.lifetime,
    })
    .with_observer(|authenticated: bool| {
        tracing::info!(authenticated, "session state changed");
    })
    .start()
    .await;

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(SessionAuthMiddleware::new(session))
        .build();

    let mut interval = time::interval(Duration::from_secs(opts.period));
    loop {
        interval.tick().await;

        match client.get(opts.url.clone()).send().await {
            Ok(resp) => tracing::info!(status = resp.status().as_u16(), "request completed"),
            Err(error) => tracing::warn!(%error, "request failed"),
        }
    }
}
