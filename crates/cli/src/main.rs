//! Command-line client for Parcel uploads.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parcel_cli::{
    ClientConfig, HttpTransport, Progress, UploadDriver, UploadReport, UploadTransport,
    client_config_path, load_client_config,
};
use parcel_core::{UploadId, UploadStatusResponse};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parcelctl")]
#[command(about = "Resumable chunked uploads to a Parcel server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Clone)]
struct ClientArgs {
    /// Client config file path
    #[arg(long, global = true, env = "PARCEL_CLIENT_CONFIG")]
    client_config: Option<String>,

    /// Server URL (overrides client config)
    #[arg(long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file
    Upload {
        /// File to upload
        file: PathBuf,
        /// Continue an interrupted upload instead of opening a new session
        #[arg(long, value_name = "UPLOAD_ID")]
        resume: Option<String>,
        /// Chunk size to propose, in bytes
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Content type to declare
        #[arg(long)]
        mime_type: Option<String>,
        /// Retries per chunk (overrides client config)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Suppress progress output
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
    /// Show an upload session
    Status {
        /// Upload ID
        upload_id: String,
    },
    /// Cancel an upload session and delete its data
    Cancel {
        /// Upload ID
        upload_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli.client)?;
    let transport = HttpTransport::new(&config.server, config.request_timeout())?;

    match cli.command {
        Commands::Upload {
            file,
            resume,
            chunk_size,
            mime_type,
            max_retries,
            quiet,
        } => {
            let mut options = config.driver_options();
            if chunk_size.is_some() {
                options.chunk_size = chunk_size;
            }
            if let Some(max_retries) = max_retries {
                options.max_retries = max_retries;
            }
            options.mime_type = mime_type;

            let driver = UploadDriver::new(transport, options);
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling upload...");
                    ctrl_c.cancel();
                }
            });

            let progress = move |p: Progress| {
                if !quiet {
                    eprintln!(
                        "  {} chunk {} ({}/{}, {:.0}%)",
                        p.upload_id,
                        p.index,
                        p.received_count,
                        p.total_chunks,
                        p.fraction() * 100.0
                    );
                }
            };

            let report = match resume {
                Some(id) => {
                    let id = parse_upload_id(&id)?;
                    driver.resume(id, &file, &cancel, progress).await
                }
                None => driver.upload(&file, &cancel, progress).await,
            }
            .with_context(|| format!("upload of {} failed", file.display()))?;
            print_report(&report);
        }
        Commands::Status { upload_id } => {
            let id = parse_upload_id(&upload_id)?;
            let status = transport
                .status(&id)
                .await
                .with_context(|| format!("failed to fetch upload {id}"))?;
            print_status(&status);
        }
        Commands::Cancel { upload_id } => {
            let id = parse_upload_id(&upload_id)?;
            transport
                .cancel(&id)
                .await
                .with_context(|| format!("failed to cancel upload {id}"))?;
            println!("Upload cancelled: {id}");
        }
    }

    Ok(())
}

fn resolve_config(args: &ClientArgs) -> Result<ClientConfig> {
    let path = client_config_path(args.client_config.as_deref())?;
    let mut config = load_client_config(&path)?;
    if let Some(server) = &args.server {
        config.server = normalize_base_url(server)?;
    }
    Ok(config)
}

fn normalize_base_url(url: &str) -> Result<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("server URL must start with http:// or https://");
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn parse_upload_id(raw: &str) -> Result<UploadId> {
    UploadId::parse(raw).with_context(|| format!("invalid upload ID: {raw}"))
}

fn print_report(report: &UploadReport) {
    println!("Upload complete: {}", report.upload_id);
    println!("Size: {} bytes in {} chunks", report.total_size, report.total_chunks);
    if let Some(sha) = &report.artifact_sha256 {
        println!("SHA-256: {sha}");
    }
}

fn print_status(status: &UploadStatusResponse) {
    println!("Upload ID: {}", status.upload_id);
    println!("File: {} ({})", status.filename, status.mime_type);
    println!("Status: {}", status.status);
    println!(
        "Chunks: {}/{} ({} bytes each, {} bytes total)",
        status.received_count, status.total_chunks, status.chunk_size, status.total_size
    );
    if !status.missing_chunks.is_empty() {
        let shown: Vec<String> = status
            .missing_chunks
            .iter()
            .take(16)
            .map(|i| i.to_string())
            .collect();
        let more = status.missing_chunks.len().saturating_sub(shown.len());
        if more > 0 {
            println!("Missing: {} (+{more} more)", shown.join(", "));
        } else {
            println!("Missing: {}", shown.join(", "));
        }
    }
    if let Some(sha) = &status.artifact_sha256 {
        println!("SHA-256: {sha}");
    }
    if let Some(error) = &status.error {
        println!("Error: {error}");
    }
    println!("Created: {}", status.created_at);
    println!("Last activity: {}", status.last_activity_at);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_strips_trailing_slash() {
        assert_eq!(
            normalize_base_url("http://example.com/").unwrap(),
            "http://example.com"
        );
        assert!(normalize_base_url("ftp://example.com").is_err());
    }

    #[test]
    fn parse_upload_id_rejects_garbage() {
        assert!(parse_upload_id("nope").is_err());
        let id = UploadId::new();
        assert_eq!(parse_upload_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn cli_parses_upload_flags() {
        let cli = Cli::try_parse_from([
            "parcelctl",
            "upload",
            "book.epub",
            "--chunk-size",
            "65536",
            "--server",
            "http://localhost:9000",
        ])
        .unwrap();
        assert_eq!(cli.client.server.as_deref(), Some("http://localhost:9000"));
        match cli.command {
            Commands::Upload {
                file, chunk_size, ..
            } => {
                assert_eq!(file, PathBuf::from("book.epub"));
                assert_eq!(chunk_size, Some(65536));
            }
            _ => panic!("expected upload"),
        }
    }
}
