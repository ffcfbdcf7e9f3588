use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use portcullis::settings::Settings;
use portcullis::web::{self, Gate};

#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version,
    about = "Identity and access proxy"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(
        proxy = %settings.proxy_addr(),
        api = %settings.api_addr(),
        backend = %settings.backend.url,
        rule_store = ?settings.rules.store,
        keys = ?settings.keys.algorithm,
        "Loaded configuration"
    );

    let gate = Gate::from_settings(settings)?;

    let token = CancellationToken::new();
    let background = gate.start_background(&token);

    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutting down");
        shutdown.cancel();
    });

    web::serve(&gate, token.clone()).await?;

    token.cancel();
    for handle in background {
        handle.await.into_diagnostic()?;
    }
    Ok(())
}
