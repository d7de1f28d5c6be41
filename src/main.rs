mod cli;

use clap::Parser;

use atlas_dispatch::logging::{init_tracing, LogOptions};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogOptions {
        file: cli.log_file.clone(),
        json: cli.json_logs,
    })?;

    // preflight only needs the server table
    if let Commands::Preflight = cli.command {
        return cli::preflight(cli.config.as_deref(), cli.json);
    }

    let (_settings, dispatcher) = atlas_dispatch::dispatcher_from_config(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Servers => cli::servers(&dispatcher, cli.json).await,
        Commands::Health { server } => cli::health(&dispatcher, server.as_deref(), cli.json).await,
        Commands::Tools { server } => cli::tools(&dispatcher, &server, cli.json).await,
        Commands::Resolve { hint, args } => {
            cli::resolve(&dispatcher, &hint, args.as_deref(), cli.json)
        }
        Commands::Call {
            hint,
            args,
            timeout_ms,
        } => cli::call(&dispatcher, &hint, args.as_deref(), timeout_ms, cli.json).await,
        Commands::Restart { server } => cli::restart(&dispatcher, &server, cli.json).await,
        Commands::WarmUp { max_tier } => cli::warm_up(&dispatcher, max_tier, cli.json).await,
        Commands::Preflight => Ok(()),
    };

    dispatcher.manager().cleanup().await;
    result
}
