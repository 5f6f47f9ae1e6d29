use anyhow::Result;
use clap::{Parser, Subcommand};

mod probe;

#[derive(Parser)]
#[command(name = "cn", version, about = "NIP-42 auth proxy CLI")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (configured from the environment)
    AuthProxy,
    /// Connect as a client, answer the AUTH challenge and print what arrives
    Probe(probe::ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::AuthProxy => {
            cn_core::logging::init(cn_auth_proxy::SERVICE_NAME, cli.json_logs);
            let config = cn_auth_proxy::load_config()?;
            cn_auth_proxy::run(config).await?;
        }
        Commands::Probe(args) => {
            cn_core::logging::init("cn-cli", cli.json_logs);
            probe::run(args).await?;
        }
    }

    Ok(())
}
