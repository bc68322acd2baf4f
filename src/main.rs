use std::process::ExitCode;

use inbox_agent::logging::init_logging;
use inbox_agent::{Agent, AgentConfig, AgentError};
use tokio_util::sync::CancellationToken;

fn print_help() {
    println!("Usage: inbox_agent <command>");
    println!();
    println!("Commands:");
    println!("  run              - Poll the inbox until Ctrl-C");
    println!("  once             - Run a single cycle and print its report");
    println!("  target <thread>  - Process one thread by id or label, read or not");
    println!("  history <thread> - Print ledger entries for a thread");
    println!("  help             - Show this message");
    println!();
    println!("Configuration is read from AGENT_* environment variables (.env supported).");
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<AgentError>() {
        Some(AgentError::Auth(_)) => ExitCode::from(2),
        Some(AgentError::FatalSession(_)) => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");
    if matches!(command, "help" | "-h" | "--help") {
        print_help();
        return ExitCode::SUCCESS;
    }

    match run(command, args.get(1).map(String::as_str)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "agent stopped");
            eprintln!("error: {:#}", e);
            exit_code(&e)
        }
    }
}

async fn run(command: &str, argument: Option<&str>) -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;
    let agent = Agent::from_config(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current thread");
            on_signal.cancel();
        }
    });

    match command {
        "run" => {
            agent.run_loop(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&agent.status())?);
        }
        "once" => {
            let report = agent.run_cycle(&cancel).await;
            agent.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
        "target" => {
            let Some(identifier) = argument else {
                anyhow::bail!("usage: inbox_agent target <thread>");
            };
            let report = agent.process_target(identifier, &cancel).await;
            agent.shutdown().await;
            match report? {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("No visible thread matches '{}'", identifier),
            }
        }
        "history" => {
            let Some(thread) = argument else {
                anyhow::bail!("usage: inbox_agent history <thread>");
            };
            for entry in agent.ledger().thread_entries(thread)? {
                println!(
                    "{}  {:<18} {}",
                    entry.recorded_at.to_rfc3339(),
                    entry.outcome.as_str(),
                    &entry.key[..12.min(entry.key.len())]
                );
            }
        }
        other => {
            print_help();
            anyhow::bail!("unknown command '{}'", other);
        }
    }
    Ok(())
}
