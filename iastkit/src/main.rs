use anyhow::{Context, Result};
use asoc::{AsocApi, AsocClient, QueryStyle};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

mod config;

#[derive(Debug, Parser)]
#[command(
    name = "iastkit",
    version,
    about = "Provision ASoC IAST agents: resolve or create applications and scans, embed agent keys, fetch reports"
)]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./iastkit.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Download an IAST agent with its key embedded, creating the application and scan as needed
    Configure {
        /// API key id
        #[arg(long)]
        id: String,
        /// API key secret
        #[arg(long)]
        secret: String,
        /// Existing application id; exits with an error if it does not exist
        #[arg(long = "app_id")]
        app_id: Option<String>,
        /// Application name; reused when it exists, created otherwise
        #[arg(long = "app_name")]
        app_name: Option<String>,
        /// Existing scan id. Reusing a scan rotates its agent key and cuts off agents still using the old one
        #[arg(long = "scan_id")]
        scan_id: Option<String>,
        /// Scan name; reused when it exists, created otherwise
        #[arg(long = "scan_name")]
        scan_name: Option<String>,
        /// Asset group for a newly created application (tenant default if omitted)
        #[arg(long = "asset_group")]
        asset_group: Option<String>,
        /// API host url. If not specified, ASoC North America is used.
        #[arg(long)]
        host: Option<String>,
    },
    /// Inject an agent key into an existing Secagent.war
    InjectKey {
        /// Agent key to embed
        #[arg(long)]
        key: String,
        /// Path to the war file or its containing directory
        #[arg(long)]
        war: PathBuf,
        /// IAST host embedded alongside the key
        #[arg(long)]
        host: Option<String>,
    },
    /// Create a scan report, wait for it, and write it to a file
    Report {
        /// API key id
        #[arg(long)]
        id: String,
        /// API key secret
        #[arg(long)]
        secret: String,
        /// Scan to report on
        #[arg(long = "scan_id")]
        scan_id: String,
        /// Output file for the report
        #[arg(long, default_value = "scan-report.xml")]
        out: PathBuf,
        /// API host url. If not specified, ASoC North America is used.
        #[arg(long)]
        host: Option<String>,
    },
    /// Start or stop agent execution directly on the IAST sub-API
    Execution {
        #[command(subcommand)]
        cmd: ExecutionCmd,
    },
}

#[derive(Debug, Subcommand)]
enum ExecutionCmd {
    /// Start a new execution
    Start {
        /// Agent key
        #[arg(long)]
        key: String,
        /// IAST host url
        #[arg(long)]
        host: Option<String>,
    },
    /// Stop the current execution
    Stop {
        /// Agent key
        #[arg(long)]
        key: String,
        /// IAST host url
        #[arg(long)]
        host: Option<String>,
    },
}

fn build_client(
    api_host: Option<String>,
    iast_host: Option<String>,
    defaults: &config::ConfigureConfig,
) -> Result<AsocClient> {
    let api_host = api_host
        .or_else(|| defaults.host.clone())
        .unwrap_or_else(|| asoc::DEFAULT_API_HOST.to_string());
    let iast_host = iast_host
        .or_else(|| defaults.iast_host.clone())
        .unwrap_or_else(|| asoc::DEFAULT_IAST_HOST.to_string());
    url::Url::parse(&api_host).with_context(|| format!("invalid host url: {api_host}"))?;
    url::Url::parse(&iast_host).with_context(|| format!("invalid host url: {iast_host}"))?;
    let style = match defaults.query_style.as_deref() {
        Some("equality") => QueryStyle::Equality,
        _ => QueryStyle::OData,
    };
    let mut client = AsocClient::new(api_host, iast_host, style)?;
    if let Some(ms) = defaults.timeout_ms {
        client = client.with_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = defaults.retries {
        client = client.with_write_retry(transport::RetryPolicy::times(retries));
    }
    Ok(client)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let loaded_cfg = config::load_config(cli.config.as_deref());
    let defaults = loaded_cfg
        .as_ref()
        .and_then(|c| c.configure.clone())
        .unwrap_or_default();
    match cli.command {
        Commands::Version => {
            println!(
                "iastkit {} (core {})",
                env!("CARGO_PKG_VERSION"),
                iastkit_core::version()
            );
        }
        Commands::Configure {
            id,
            secret,
            app_id,
            app_name,
            scan_id,
            scan_name,
            mut asset_group,
            host,
        } => {
            if asset_group.is_none() {
                asset_group = defaults.asset_group.clone();
            }
            let client = build_client(host, None, &defaults)?;
            let req = provision::ProvisionRequest {
                key_id: id,
                key_secret: secret,
                app_id,
                app_name,
                scan_id,
                scan_name,
                asset_group,
                work_dir: std::env::current_dir()?,
            };
            let rt = tokio::runtime::Runtime::new()?;
            let outcome = rt.block_on(provision::provision(&client, &req))?;
            println!(
                "{} ready: application {} ({}), scan {} ({})",
                outcome.bundle.display(),
                outcome.app_name,
                outcome.app_id,
                outcome.scan_name,
                outcome.scan_id
            );
        }
        Commands::InjectKey { key, war, host } => {
            let host = host
                .or_else(|| defaults.iast_host.clone())
                .unwrap_or_else(|| asoc::DEFAULT_IAST_HOST.to_string());
            let war_path = archive::inject_key_into_war(&war, &key, &host)?;
            println!("updated {}", war_path.display());
        }
        Commands::Report {
            id,
            secret,
            scan_id,
            out,
            host,
        } => {
            let max_retries = loaded_cfg
                .as_ref()
                .and_then(|c| c.report.as_ref())
                .and_then(|r| r.max_retries)
                .unwrap_or(asoc::DEFAULT_REPORT_RETRIES);
            let client = build_client(host, None, &defaults)?;
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(async {
                let token = client.api_key_login(&id, &secret).await?;
                provision::fetch_report(&client, &token, &scan_id, max_retries).await
            })?;
            std::fs::write(&out, report)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("report written to {}", out.display());
        }
        Commands::Execution { cmd } => {
            let rt = tokio::runtime::Runtime::new()?;
            match cmd {
                ExecutionCmd::Start { key, host } => {
                    let client = build_client(None, host, &defaults)?;
                    let execution_id = rt.block_on(client.start_execution(&key))?;
                    println!("execution started: {execution_id}");
                }
                ExecutionCmd::Stop { key, host } => {
                    let client = build_client(None, host, &defaults)?;
                    rt.block_on(client.stop_execution(&key))?;
                    println!("execution stopped");
                }
            }
        }
    }
    Ok(())
}
