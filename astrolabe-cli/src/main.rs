mod cli;
mod error;
mod session;

use astrolabe_core::model::ModelClient;
use astrolabe_core::model::clients::OllamaClient;
use astrolabe_core::tooling::SupervisorOptions;
use astrolabe_core::{AgentRoundTripController, ServerConfigStore, ToolOrchestrator};
use clap::Parser;
use cli::Cli;
use error::CliError;
use session::{Session, compose_system_prompt, print_outcome, run_loop};
use std::error::Error;
use std::sync::Once;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// `ASTROLABE_LOG` wins over `RUST_LOG`, which wins over `--log-level`.
fn init_tracing(default_filter: &str) {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_env("ASTROLABE_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .init();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{}", err.user_message());
        return Err(err.into());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let configs = ServerConfigStore::load(&cli.servers);
    let options = SupervisorOptions::default()
        .with_log_dir(cli.log_dir.clone())
        .with_log_level(cli.server_log_level)
        .with_interactive_logs(cli.interactive_logs);

    let mut orchestrator = ToolOrchestrator::new(configs, options);
    let report = orchestrator.bootstrap().await;
    for (server, reason) in &report.failed {
        eprintln!("warning: tool server '{server}' is unavailable: {reason}");
    }

    let model = OllamaClient::new(cli.endpoint.clone());
    let controller =
        AgentRoundTripController::new(cli.model.clone()).with_native_tools(!cli.no_native_tools);
    let mut session = Session::new(compose_system_prompt(
        cli.system.as_deref(),
        &orchestrator.system_prompt(),
    ));

    let result = tokio::select! {
        result = converse(&cli, &mut session, &controller, &model, &mut orchestrator) => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Interrupted; stopping tool servers"),
                Err(err) => warn!(error = %err, "Could not listen for Ctrl-C"),
            }
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    result
}

async fn converse(
    cli: &Cli,
    session: &mut Session,
    controller: &AgentRoundTripController,
    model: &dyn ModelClient,
    orchestrator: &mut ToolOrchestrator,
) -> Result<(), CliError> {
    let mut stdout = tokio::io::stdout();
    match cli.prompt.as_deref() {
        Some(prompt) => {
            let outcome = session.ask(prompt, controller, model, orchestrator).await?;
            print_outcome(&mut stdout, &outcome).await
        }
        None => {
            run_loop(
                BufReader::new(tokio::io::stdin()),
                &mut stdout,
                session,
                cli.system.as_deref(),
                controller,
                model,
                orchestrator,
            )
            .await
        }
    }
}
