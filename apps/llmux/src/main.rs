use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bootstrap;
mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    match args.command {
        cli::Command::Run { config, host, port } => {
            let runtime = bootstrap::bootstrap(&config).await?;
            let app = llmux_server::router(runtime.state);
            let bind = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!(event = "listening", bind = %bind);
            axum::serve(listener, app).await?;
        }
        cli::Command::Validate { config } => {
            let (assembly, scheduler) = bootstrap::load_documents(&config)?;
            let report = llmux_config::validate(&assembly, &scheduler);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid {
                std::process::exit(1);
            }
        }
        cli::Command::Login { provider, dialect } => {
            bootstrap::login(&provider, &dialect).await?;
        }
    }
    Ok(())
}
