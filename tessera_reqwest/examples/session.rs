use std::path::PathBuf;

use clap::{Parser, Subcommand};
use predicates::prelude::PredicateBooleanExt;
use reqwest_middleware::ClientBuilder;
use tessera_guard::{Decision, NavigationGuard, RouteTable};
use tessera_reqwest::{AccessTokenMiddleware, HttpsOnly, SameOrigin};
use tessera_tokens::{store::FileTokenStore, AuthorizationCode, SessionConfig, SessionManager};

#[derive(Debug, Parser)]
struct Opts {
    /// The base URL of the API hosting the auth endpoints
    #[arg(short, long, env = "TESSERA_API_URL")]
    api_url: reqwest::Url,

    /// The OAuth client ID registered with the identity provider
    #[arg(short, long, env = "TESSERA_CLIENT_ID", default_value = "")]
    client_id: String,

    /// The local file used to persist the session
    #[arg(
        short = 'f',
        long,
        env = "TESSERA_TOKEN_FILE",
        default_value = "auth_tokens.json"
    )]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the recovered session
    Status,
    /// Start a login and print the identity provider's URL
    Login,
    /// Finish a login with the code the identity provider returned
    Callback {
        /// The authorization code
        code: String,
    },
    /// Exchange the refresh token for new tokens
    Refresh,
    /// End the session
    Logout,
    /// Send an authorized GET to a path on the API
    Get {
        /// The path, relative to the API base URL
        path: String,
    },
    /// Ask the navigation guard about an in-app path
    Guard {
        /// The in-app path, such as `/` or `/signin`
        path: String,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = SessionConfig::new(opts.api_url, opts.client_id)?;
    let http = reqwest::Client::builder().build()?;

    let session = SessionManager::builder(config.clone(), ClientBuilder::new(http.clone()).build())
        .with_store(FileTokenStore::new(opts.token_file))
        .with_redirector(|url: &reqwest::Url| println!("Continue signing in at:\n  {url}"))
        .build()?;

    if let Err(error) = session.init().await {
        tracing::warn!(%error, "persisted session could not be recovered");
    }

    match opts.command {
        Command::Status => {}
        Command::Login => session.begin_login().await?,
        Command::Callback { code } => {
            session
                .complete_login(&AuthorizationCode::from(code))
                .await?
        }
        Command::Refresh => {
            session.refresh().await?;
        }
        Command::Logout => session.logout().await,
        Command::Get { path } => {
            let client = ClientBuilder::new(http)
                .with(
                    AccessTokenMiddleware::new(session.clone())
                        .with_predicate(HttpsOnly.and(SameOrigin::of(config.api_base_url()))),
                )
                .build();

            let resp = client.get(config.api_base_url().join(&path)?).send().await?;
            println!("{}", resp.status());
            println!("{}", resp.text().await?);
        }
        Command::Guard { path } => {
            let table = RouteTable::default();
            let route = table.resolve(&path);
            match NavigationGuard::default().check(session.has_access_token(), route) {
                Decision::Allow => println!("allow {}", route.name()),
                Decision::Redirect(to) => println!("redirect {} -> {to}", route.name()),
            }
            return Ok(());
        }
    }

    let state = session.state();
    println!("status:        {:?}", state.status());
    println!("authenticated: {}", state.is_authenticated());
    if let Some(user) = state.user() {
        println!(
            "user:          {} <{}>",
            user.name().unwrap_or("(no name)"),
            user.email().unwrap_or("(no email)")
        );
    }
    if let Some(tokens) = state.tokens() {
        println!("access token:  {:#?}", tokens.access_token());
    }

    Ok(())
}
