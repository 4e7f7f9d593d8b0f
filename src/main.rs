#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use modelfetch::config::Config;
use modelfetch::downloads::{format_bytes, DownloadManager, DownloadRecord, StartRequest};
use modelfetch::error::{FetchError, Result};
use modelfetch::ipc::{client::IpcClient, server::IpcServer, Command, Response};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "modelfetch")]
#[command(about = "Model download manager for trusted model hosts", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/modelfetch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Daemon,
    /// Request a model download
    Download {
        url: String,
        /// Model category, e.g. checkpoints, loras, vae
        #[arg(short, long)]
        category: String,
        /// Target filename (default: last URL path segment)
        #[arg(short, long)]
        filename: Option<String>,
        /// Requesting user (default: $USER)
        #[arg(long)]
        owner: Option<String>,
        /// Follow progress until the download finishes
        #[arg(short, long)]
        watch: bool,
    },
    /// Show one download
    Status { id: String },
    /// Cancel a running download
    Cancel { id: String },
    /// List all downloads
    List,
    /// Follow a download with a progress bar
    Watch { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    modelfetch::logging::init(&config.logging);

    let result = match cli.command {
        None | Some(Commands::Daemon) => {
            tracing::info!("Starting modelfetch daemon");
            return run_daemon(config).await;
        }
        Some(Commands::Download {
            url,
            category,
            filename,
            owner,
            watch,
        }) => {
            let request = StartRequest {
                filename: filename.unwrap_or_else(|| filename_from_url(&url)),
                owner: owner
                    .or_else(|| std::env::var("USER").ok())
                    .unwrap_or_else(|| "anonymous".to_string()),
                url,
                category,
            };
            run_download(&config, request, watch).await
        }
        Some(Commands::Status { id }) => run_client(&config, Command::Status { id }).await,
        Some(Commands::Cancel { id }) => run_client(&config, Command::Cancel { id }).await,
        Some(Commands::List) => run_client(&config, Command::List).await,
        Some(Commands::Watch { id }) => run_watch(&config, &id).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    let manager = Arc::new(DownloadManager::new(&config)?);
    manager.sweep_scratch().await;
    let server = IpcServer::new(Arc::clone(&manager), config.socket_path()?);

    tracing::info!(
        "Daemon started, models in {}, scratch in {}",
        config.storage.models_dir.display(),
        manager.scratch_dir().display()
    );

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

async fn run_download(config: &Config, request: StartRequest, watch: bool) -> Result<()> {
    let client = IpcClient::new(config)?;
    let response = client.send_command(Command::Start(request)).await?;

    let reply = match response {
        Response::Started(reply) => reply,
        other => return print_response(other),
    };

    match &reply.id {
        Some(id) => println!("{id} {} {}", reply.status, reply.destination_path.display()),
        None => println!("{} {}", reply.status, reply.destination_path.display()),
    }
    if let Some(message) = &reply.message {
        println!("{message}");
    }

    match reply.id {
        Some(id) if watch => run_watch(config, &id).await,
        _ => Ok(()),
    }
}

async fn run_client(config: &Config, cmd: Command) -> Result<()> {
    let client = IpcClient::new(config)?;
    let response = client.send_command(cmd).await?;
    print_response(response)
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Started(reply) => {
            println!("{} {}", reply.status, reply.destination_path.display());
        }
        Response::Record(record) => print_record(&record),
        Response::Records(records) => {
            if records.is_empty() {
                println!("No downloads");
            }
            for record in &records {
                print_record(record);
            }
        }
        Response::Cancel { success, message } => {
            println!("{message}");
            if !success {
                std::process::exit(1);
            }
        }
        Response::Error { kind, message } => {
            return Err(FetchError::Other(format!(
                "{message} ({})",
                kind.status_code()
            )));
        }
    }

    Ok(())
}

fn print_record(record: &DownloadRecord) {
    println!(
        "{}  {:<11}  {:>6.1}%  {:>10}  {}",
        record.id,
        record.status,
        record.percent_complete,
        format_bytes(record.bytes_transferred),
        record.filename
    );
    if let Some(error) = &record.error_message {
        println!("    {error}");
    }
}

async fn run_watch(config: &Config, id: &str) -> Result<()> {
    let client = IpcClient::new(config)?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );

    let last = client
        .watch(id, |record| {
            bar.set_message(record.filename.clone());
            if record.bytes_total > 0 {
                bar.set_length(record.bytes_total);
            }
            bar.set_position(record.bytes_transferred);
        })
        .await;

    match last {
        Ok(record) => {
            bar.finish_with_message(format!("{} {}", record.filename, record.status));
            if let Some(error) = &record.error_message {
                eprintln!("{error}");
            }
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

/// Last non-empty path segment of a URL, without query or fragment
fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://huggingface.co/org/repo/resolve/main/model.safetensors"),
            "model.safetensors"
        );
        assert_eq!(
            filename_from_url("https://civitai.com/models/v.ckpt?download=true#x"),
            "v.ckpt"
        );
        assert_eq!(filename_from_url("https://example.com/dir/"), "dir");
    }
}
