//! Zentinel Intercept - CLI Entry Point
//!
//! Loads a fixture file, replays recorded requests against it and prints the
//! synthesized responses.

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_intercept::{
    Dispatch, FixtureConfig, InterceptedRequest, Registry, RequestDescription, Transport,
};

#[derive(Parser, Debug)]
#[command(
    name = "zentinel-intercept",
    about = "HTTP interception test double - replay requests against declared fixtures",
    version
)]
struct Args {
    /// Path to fixture file
    #[arg(short, long, default_value = "fixtures.yaml")]
    config: PathBuf,

    /// JSON file holding one request or a list of requests to replay
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print example fixtures and exit
    #[arg(long)]
    print_config: bool,

    /// Validate fixtures and exit
    #[arg(long)]
    validate: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequestFile {
    Many(Vec<RequestDescription>),
    One(RequestDescription),
}

impl RequestFile {
    fn into_requests(self) -> Vec<RequestDescription> {
        match self {
            RequestFile::Many(requests) => requests,
            RequestFile::One(request) => vec![request],
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-fixtures.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    if !args.config.exists() {
        anyhow::bail!("Fixture file not found: {:?}", args.config);
    }
    info!(path = ?args.config, "Loading fixtures");
    let config = FixtureConfig::from_file(&args.config)?;

    if args.validate {
        println!(
            "Fixtures are valid ({} scopes, {} interceptors defined)",
            config.scopes.len(),
            config.interceptor_count()
        );
        return Ok(());
    }

    let registry = Registry::new();
    let scopes = config.install(&registry)?;
    info!(
        scopes = scopes.len(),
        interceptors = config.interceptor_count(),
        "Fixtures installed"
    );

    let requests = match &args.request {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<RequestFile>(&content)?.into_requests()
        }
        None => Vec::new(),
    };

    let mut failures = 0usize;
    for description in requests {
        let request = InterceptedRequest::try_from(description)?;
        match registry.dispatch(request).await {
            Ok(Dispatch::Mocked(served)) => {
                println!("{}", serde_json::to_string_pretty(&served.response)?);
            }
            Ok(Dispatch::Passthrough(request)) => {
                warn!(url = %request.url(), "Request would reach the network");
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {}", e);
            }
        }
    }

    let pending = registry.pending_mocks();
    for expectation in &pending {
        warn!(expectation = %expectation, "Expectation not satisfied");
    }

    if failures > 0 || !pending.is_empty() {
        anyhow::bail!(
            "{} request(s) failed, {} expectation(s) pending",
            failures,
            pending.len()
        );
    }

    info!(
        requests = registry.total_requests(),
        matched = registry.total_matched(),
        "All expectations satisfied"
    );
    Ok(())
}
