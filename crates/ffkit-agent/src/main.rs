//! Fin & Feathers offline agent host.
//!
//! ## Usage
//!
//! ```bash
//! # Print the version this build deploys
//! ffkit-agent version
//!
//! # Register against the configured origin and run a command script
//! ffkit-agent --config agent.json run --script session.jsonl
//!
//! # Commands can also be piped in
//! echo '{"command":"fetch","path":"/"}' | ffkit-agent run
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ffkit_common::{init_logging, LogConfig, LogFormat};
use ffkit_net::{LoaderConfig, ResourceLoader};
use ffkit_sw::AgentConfig;
use tracing::{info, warn};

mod script;

use script::{HostCommand, Session};

#[derive(Parser)]
#[command(name = "ffkit-agent")]
#[command(about = "Run the Fin & Feathers offline agent against a live origin")]
#[command(version)]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "pretty", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the deployed version as JSON
    Version,

    /// Register the agent and execute JSON-lines commands
    Run {
        /// Command script; reads stdin when omitted
        #[arg(short, long)]
        script: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log.with_format(cli.log_format))?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("{}", serde_json::to_string(&config.version_info())?);
        }
        Commands::Run { script } => {
            run(config, script.as_deref()).await?;
        }
    }

    Ok(())
}

/// Load the configuration file, or the built-in defaults when none is given.
fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let config = AgentConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(config: AgentConfig, script: Option<&Path>) -> Result<()> {
    let mut loader_config = LoaderConfig::default();
    if let Some(timeout) = config.network_timeout() {
        loader_config.default_timeout = timeout;
    }
    let network = Arc::new(ResourceLoader::new(loader_config)?);

    let (mut session, report) = Session::start(config, network).await?;
    info!(
        bucket = %report.bucket,
        cached = report.cached.len(),
        failed = report.failed.len(),
        "Agent active"
    );
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Some pre-cache entries are missing");
    }

    let lines: Box<dyn BufRead> = match script {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open script {}", path.display()))?,
        )),
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    for (number, line) in lines.lines().enumerate() {
        let line = line.context("failed to read script")?;
        let command = match HostCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping command");
                continue;
            }
        };

        let result = session.execute(command).await;
        let mut out = stdout.lock();
        writeln!(out, "{}", result)?;
        out.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.app_name, "fin-feathers");
        assert_eq!(config.cache_name(), format!("fin-feathers-v{}", config.version));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "origin": "https://finandfeathers.example/",
                "version": "3.2.0",
                "is_critical": true,
                "precache": ["/", "/index.html"]
            }}"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.version, "3.2.0");
        assert!(config.is_critical);
        assert_eq!(config.precache, vec!["/", "/index.html"]);
        assert_eq!(config.shell_page, "/index.html");
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{ "api_prefix": "api" }"#).unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("api_prefix"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "ffkit-agent",
            "--log-format",
            "json",
            "run",
            "--script",
            "session.jsonl",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Run { script: Some(_) }));
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["ffkit-agent", "--log-format", "xml", "version"]).is_err());
    }
}
