//! Deriva CLI - inference conformance and drift telemetry
//!
//! Run the host artifact service, the client telemetry pipeline, build the
//! model zoo, or print the probed system identity.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deriva::telemetry::Source;
use deriva::{paths, pipeline, server::HostService, system, zoo};

/// Deriva - cross-device inference conformance and drift harness
#[derive(Parser)]
#[command(name = "deriva")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base data directory (overrides auto-detect; DERIVA_DATA_DIR wins)
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host artifact service
    Serve {
        /// Port to bind on all interfaces
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Directory to serve (defaults to the base data directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Pull models from a host, run the probe, push the report back
    Telemetry {
        /// Host base URL, e.g. http://192.168.1.20:8080
        #[arg(long)]
        host: String,

        /// Source tag: native | wasm-bun | wasm-ionic
        #[arg(long, default_value = "native")]
        source: String,
    },
    /// Create the canonical MNIST model zoo and its manifest
    Zoo,
    /// Show probed system info and machine id
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> deriva::Result<()> {
    match cli.command {
        Commands::Serve { port, dir } => {
            let public = match dir {
                Some(d) => d,
                None => paths::resolve_base(cli.base.as_deref())?,
            };
            HostService::new(port, public).serve().await
        }
        Commands::Telemetry { host, source } => {
            let source: Source = source.parse()?;
            let base = paths::resolve_base(cli.base.as_deref())?;
            let path = tokio::task::spawn_blocking(move || {
                pipeline::run_pipeline(&host, source, &base)
            })
            .await
            .map_err(|e| deriva::DerivaError::Config(format!("pipeline task failed: {e}")))??;
            println!("✅ Telemetry saved locally → {}", path.display());
            Ok(())
        }
        Commands::Zoo => {
            let base = paths::resolve_base(cli.base.as_deref())?;
            let manifest = zoo::create_model_zoo(&base, &zoo::default_specs())?;
            println!("✅ Model zoo ready, manifest at {}", manifest.display());
            Ok(())
        }
        Commands::Info => {
            let info = system::collect();
            println!("{}", info.to_json());
            println!("machine_id: {}", system::machine_id(&info));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::parse_from(["deriva", "serve", "--port", "9090"]);
        match cli.command {
            Commands::Serve { port, dir } => {
                assert_eq!(port, 9090);
                assert!(dir.is_none());
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parses_telemetry_with_source() {
        let cli = Cli::parse_from([
            "deriva",
            "telemetry",
            "--host",
            "http://192.168.1.20:8080",
            "--source",
            "wasm-bun",
        ]);
        match cli.command {
            Commands::Telemetry { host, source } => {
                assert_eq!(host, "http://192.168.1.20:8080");
                assert_eq!(source.parse::<Source>().unwrap(), Source::WasmBun);
            }
            _ => panic!("expected Telemetry command"),
        }
    }

    #[test]
    fn test_cli_global_base_flag() {
        let cli = Cli::parse_from(["deriva", "--base", "/tmp/x", "zoo"]);
        assert_eq!(cli.base, Some(PathBuf::from("/tmp/x")));
    }
}
