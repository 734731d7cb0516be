//! postflow - credential rotation and OAuth callback server

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use postflow::{
    cli::{Cli, Command, StatesCommand},
    config::Config,
    oauth::{self, Provider, build_authorization_url},
    rotation::{ApiRequest, KeyRotationManager, ReqwestTransport},
    server::Server,
    setup_tracing, store,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    let result = match cli.command {
        Some(Command::AuthorizeUrl { provider }) => run_authorize_url(&config, &provider).await,
        Some(Command::Call {
            pool,
            url,
            method,
            headers,
            data,
        }) => run_call(&config, &pool, url, &method, &headers, data).await,
        Some(Command::Keys { pool }) => run_keys(&config, pool.as_deref()),
        Some(Command::States(cmd)) => run_states(&config, cmd).await,
        Some(Command::Serve) | None => run_server(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the server
async fn run_server(config: Config) -> postflow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        pools = config.pools.len(),
        providers = config.oauth.providers.len(),
        "Starting postflow"
    );
    Server::new(config)?.run().await
}

/// Issue a state and print the provider authorization URL
async fn run_authorize_url(config: &Config, provider: &str) -> postflow::Result<()> {
    let provider: Provider = provider.parse()?;
    let settings = config.provider(provider)?;
    config.require_persistent_storage("authorize-url")?;

    let store = store::open(&config.storage)?;
    let handler = oauth::callback_handler(&store, &config.oauth);
    let state = handler.states().generate_state(provider).await?;

    let url = build_authorization_url(
        &settings.authorization_endpoint,
        &settings.client_id,
        &settings.scopes,
        &config.server.redirect_uri(provider),
        &state,
    )?;
    println!("{url}");
    Ok(())
}

/// Execute one request through a key pool and print the response
async fn run_call(
    config: &Config,
    pool_name: &str,
    url: String,
    method: &str,
    headers: &[String],
    data: Option<String>,
) -> postflow::Result<()> {
    let pool = config.pool(pool_name)?;
    let transport = Arc::new(ReqwestTransport::with_timeout(pool.timeout)?);
    let manager = KeyRotationManager::from_config(pool_name, pool, transport)?;

    let method: reqwest::Method = method
        .to_ascii_uppercase()
        .parse()
        .map_err(|e| postflow::Error::Config(format!("Invalid method '{method}': {e}")))?;
    let mut request = ApiRequest::new(method, url);
    for header in headers {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            postflow::Error::Config(format!("Header must be 'Name: value', got '{header}'"))
        })?;
        request = request.header(name.trim(), value.trim());
    }
    if let Some(body) = data {
        request = request.body(body);
    }

    let response = manager.execute(&request).await?;
    eprintln!("HTTP {}", response.status);
    println!("{}", response.text());
    Ok(())
}

/// Print masked pool diagnostics
fn run_keys(config: &Config, pool: Option<&str>) -> postflow::Result<()> {
    let mut names: Vec<&str> = match pool {
        Some(name) => vec![name],
        None => config.pools.keys().map(String::as_str).collect(),
    };
    names.sort_unstable();

    for name in names {
        let manager = KeyRotationManager::from_config(
            name,
            config.pool(name)?,
            Arc::new(ReqwestTransport::new(reqwest::Client::new())),
        )?;
        println!("{name}: {}", serde_json::to_string_pretty(&manager.stats())?);
    }
    Ok(())
}

/// OAuth state maintenance
async fn run_states(config: &Config, cmd: StatesCommand) -> postflow::Result<()> {
    config.require_persistent_storage("states")?;
    let store = store::open(&config.storage)?;
    let handler = oauth::callback_handler(&store, &config.oauth);

    match cmd {
        StatesCommand::Sweep => {
            let removed = handler.states().cleanup_expired_states().await?;
            println!("Removed {removed} stale state(s)");
        }
        StatesCommand::Clear => {
            handler.states().clear_all_states().await?;
            handler.codes().clear_used_codes().await?;
            println!("Cleared all OAuth states and used codes");
        }
    }
    Ok(())
}
