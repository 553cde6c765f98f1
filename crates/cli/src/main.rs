use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use clawdis_gateway::{config::GatewayConfig, server::run_gateway, services::GatewayServices};

#[derive(Parser)]
#[command(name = "clawdis", about = "clawdis — local WebSocket gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Port to listen on (loopback only).
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is provided).
    Gateway,
    /// Print the frame protocol's JSON Schema document.
    Schema,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command.as_ref().unwrap_or(&Commands::Gateway) {
        Commands::Gateway => {
            let mut config = GatewayConfig::from_env();
            if let Some(port) = cli.port {
                config.port = port;
            }

            let shutdown = CancellationToken::new();
            let ctrl_c = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received ctrl-c, shutting down");
                    ctrl_c.cancel();
                }
            });

            run_gateway(config, GatewayServices::noop(), shutdown).await
        },
        Commands::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&clawdis_protocol::schema::schema_document())?
            );
            Ok(())
        },
    }
}
