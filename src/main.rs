use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxroom::bridge::AudioBridge;
use voxroom::config::Config;
use voxroom::driver::{FormLoginDriver, SessionDriver};
use voxroom::interceptor::InterceptorConfig;
use voxroom::page::{BrowserSession, PageChannel};
use voxroom::voice::{create_voice_client, ProviderKind};

/// Puts a real-time speech AI into a browser-based virtual office.
#[derive(Parser)]
#[command(name = "voxroom", version, about, long_about = None)]
struct Cli {
    /// Config file (default: $VOXROOM_CONFIG, then the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `voxroom=trace,page=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the browser, join the office and bridge audio until Ctrl-C
    Run,

    /// Load and validate the config, then print it (secrets redacted)
    CheckConfig,

    /// Print the page interceptor script as it would be injected
    Script {
        /// Provider to render for; taken from the config when omitted
        #[arg(long)]
        provider: Option<ProviderKind>,
    },
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("Invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Run => {
            let config = Config::load(cli.config.as_deref())?;
            run(config).await
        }
        Commands::CheckConfig => check_config(cli.config.as_deref()),
        Commands::Script { provider } => {
            let provider = match provider {
                Some(provider) => provider,
                None => Config::load(cli.config.as_deref())?.voice.provider,
            };
            print_script(provider)
        }
    }
}

fn check_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(path)?;
    config
        .voice
        .provider_config()
        .context("Invalid [voice] section")?;
    println!("Config OK: {}", config.config_path.display());
    println!("{config:#?}");
    Ok(())
}

fn print_script(provider: ProviderKind) -> Result<()> {
    let capture_rate = provider.input_sample_rate();
    let script = InterceptorConfig::new(
        provider.output_sample_rate(),
        capture_rate,
        voxroom::audio::pcm_mime_type(capture_rate),
    )
    .render()
    .context("Failed to render the interceptor")?;
    println!("{script}");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    // Bad provider settings abort before any browser is launched.
    let client = create_voice_client(&config.voice).context("Invalid [voice] section")?;
    tracing::info!(
        provider = client.provider_label(),
        input_rate = client.preferred_sample_rate(),
        output_rate = client.output_sample_rate(),
        "Voice client created"
    );

    let session = BrowserSession::launch(&config.browser).await?;
    let page: Arc<dyn PageChannel> = session.page();
    let bridge = AudioBridge::new(Arc::clone(&page), client, config.bridge.clone());
    let driver = FormLoginDriver::new(config.office.clone());

    let outcome = join_and_wait(&bridge, &driver, page.as_ref()).await;

    bridge.stop().await;
    session.close().await;
    outcome
}

async fn join_and_wait(
    bridge: &AudioBridge,
    driver: &dyn SessionDriver,
    page: &dyn PageChannel,
) -> Result<()> {
    bridge
        .setup_before_login()
        .await
        .context("Audio bridge setup failed")?;

    driver
        .enter(page)
        .await
        .with_context(|| format!("Session driver '{}' failed", driver.name()))?;

    let report = bridge
        .complete_setup()
        .await
        .context("Audio bridge activation failed")?;
    if report.outbound_only() {
        tracing::warn!("Running outbound-only: the AI can speak but cannot hear the room");
    }

    tracing::info!("voxroom running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    Ok(())
}
