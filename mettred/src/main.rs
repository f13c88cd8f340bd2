use mettred::daemon::{self, DaemonConfig, DaemonRuntime};
use mettred::telemetry::init_logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: mettred [--status]");
        println!("  --status   Print put.io account usage and transfers, then exit");
        println!("Configuration is read from METTRE_* environment variables or a .env file.");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    init_logging(config.log_format)?;
    if mode == CliMode::Status {
        let report = daemon::status_report(&config).await?;
        println!("{report}");
        return Ok(());
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
