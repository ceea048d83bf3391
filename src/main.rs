use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wpaudit::client::{PushTarget, UploadClient};
use wpaudit::{App, Config};

/// Chunked upload intake and LLM-backed review of WordPress site files.
#[derive(Parser)]
#[command(name = "wpaudit", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway and scan workers
    Serve,
    /// Analyze new or changed files under the stored wordpress/ tree
    ScanDir {
        /// Limit the walk to one site and record scans under this URL
        #[arg(long)]
        site_url: Option<String>,
    },
    /// Process one scan in the foreground
    Process { scan_id: i64 },
    /// Process scans still waiting in pending
    ProcessPending {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Reset scans stuck in processing and run them again
    RetryStuck {
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete or archive old scans and purge stale upload sessions
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
        /// Archive instead of deleting
        #[arg(long)]
        archive: bool,
        /// Most scans handled in this run
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Upload a local file to a running gateway in chunks
    Push {
        file: PathBuf,
        /// Gateway base URL (defaults to http://<server.bind>)
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        site_url: String,
        /// Path of the file within the site, e.g. wp-content/themes/x/functions.php
        #[arg(long)]
        file_path: String,
        /// Defaults to the file extension
        #[arg(long)]
        file_type: Option<String>,
        #[arg(long, default_value = "")]
        theme: String,
        /// Upload chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the JSON schema of the config file
    Schema,
    /// Print the effective configuration with secrets masked
    Show,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_type_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve => {
            let app = App::build(config)?;
            app.serve(shutdown_token()).await
        }
        Commands::ScanDir { site_url } => {
            let app = App::build(config)?;
            let report = app
                .directory_scanner()
                .scan(site_url.as_deref(), &shutdown_token())
                .await?;
            print_json(&report)
        }
        Commands::Process { scan_id } => {
            let app = App::build(config)?;
            let outcome = app.processor.process(scan_id, &shutdown_token()).await?;
            println!("scan {scan_id}: {outcome:?}");
            Ok(())
        }
        Commands::ProcessPending { limit } => {
            let limit = limit.unwrap_or(config.scan.pending_limit);
            let app = App::build(config)?;
            let report = app.process_pending(limit, &shutdown_token()).await?;
            print_json(&report)
        }
        Commands::RetryStuck { hours, limit } => {
            let hours = hours.unwrap_or(config.scan.stuck_after_hours);
            let limit = limit.unwrap_or(config.scan.stuck_limit);
            let app = App::build(config)?;
            let reset = app
                .retention()
                .reset_stuck(Duration::from_secs(u64::from(hours) * 3600), limit)?;
            let cancel = shutdown_token();
            for scan_id in &reset {
                match app.processor.process(*scan_id, &cancel).await {
                    Ok(outcome) => info!(scan_id, ?outcome, "Stuck scan reprocessed"),
                    Err(e) => warn!(scan_id, "Stuck scan failed again: {e}"),
                }
            }
            println!("{} stuck scan(s) reset", reset.len());
            Ok(())
        }
        Commands::Cleanup {
            days,
            archive,
            limit,
        } => {
            let days = days.unwrap_or(config.scan.retention_days);
            let limit = limit.unwrap_or(config.scan.cleanup_limit);
            let archive = archive || config.scan.archive_instead_of_delete;
            let ttl = Duration::from_secs(config.uploads.session_ttl_secs);
            let app = App::build(config)?;
            let retention = app.retention();
            let report = retention.cleanup_scans(days, archive, limit).await?;
            let purged = retention.purge_sessions(ttl).await?;
            print_json(&serde_json::json!({
                "scans": report,
                "sessions_purged": purged,
            }))
        }
        Commands::Push {
            file,
            server,
            site_url,
            file_path,
            file_type,
            theme,
            chunk_size,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let server = server.unwrap_or_else(|| format!("http://{}", config.server.bind));
            let client = UploadClient::new(&server, config.server.api_key.clone());
            let target = PushTarget {
                site_url,
                theme,
                file_type: file_type.unwrap_or_else(|| file_type_of(&file)),
                file_path,
                chunk_bytes: chunk_size.unwrap_or(config.uploads.client_chunk_bytes),
            };
            let report = client.push(&bytes, &target).await?;
            println!(
                "uploaded {} bytes in {} chunk(s); scan {}",
                report.bytes, report.chunks, report.scan_id
            );
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
            ConfigAction::Show => {
                print!("{}", config.to_masked_toml()?);
                Ok(())
            }
        },
    }
}
