//! Panefleet CLI entry point.
//!
//! Binary name: `pfleet`

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use panefleet_infra::config::{default_data_dir, load_engine_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,panefleet=debug",
        _ => "trace",
    };
    panefleet_observe::tracing_setup::init_tracing(filter, cli.json, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need configuration
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pfleet", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = load_engine_config(&data_dir).await;

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.json),
        Commands::Plan { file } => cli::workflow::handle_plan(&file, cli.json),
        Commands::Run {
            workflow,
            vars,
            vars_json,
            session,
            dry_run,
            run_id,
        } => {
            let args = cli::workflow::RunArgs {
                workflow,
                vars,
                vars_json,
                session,
                dry_run,
                run_id,
            };
            cli::workflow::handle_run(args, &config, &data_dir, cli.json, cli.quiet).await
        }
        Commands::List => cli::workflow::handle_list(&config, &data_dir, cli.json).await,
        Commands::Schema => cli::workflow::handle_schema(),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    panefleet_observe::tracing_setup::shutdown_tracing();
    result
}
