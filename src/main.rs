use agora::cli::commands::{self, QueryArgs};
use agora::cli::output::Output;
use agora::cli::{Cli, Commands};
use agora::utils::logging::init_tracing;
use agora::AgoraConfig;
use std::path::Path;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before clap so AGORA_CONFIG can come from it
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    match run(cli, &output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let config = match AgoraConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            output.hint("Pass --config <file> or set AGORA_CONFIG");
            return Err(e.into());
        }
    };

    if let Err(e) = init_tracing(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let base_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    match cli.command {
        Commands::Query {
            text,
            user,
            deadline_ms,
            mode,
            json,
        } => {
            if !json {
                output.banner();
            }
            let args = QueryArgs {
                text,
                user,
                deadline_ms,
                mode,
                json,
            };
            commands::run_query(config, &base_dir, args, output).await?;
        }
        Commands::Agents => commands::list_agents(&config, output),
        Commands::Config { validate } => {
            commands::show_config(&config, &cli.config, validate, output)?
        }
    }

    Ok(())
}
