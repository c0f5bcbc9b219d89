//! savsend CLI
//!
//! Dump a save chip to a remote server, or restore it from one.

mod config;
mod progress;
mod serve;

use clap::{ArgGroup, Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use savsend_core::{
    BlockDevice, CancelToken, ConfigError, Direction, Endpoint, EndpointResolver, ImageDevice,
    SessionController, SessionReport, TcpResolver, TransferEngine,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use config::Settings;
use progress::{TransferProgress, format_bytes, format_duration, format_speed};
use serve::ServeMode;

/// savsend - dump and restore game saves over the network
#[derive(Parser)]
#[command(name = "savsend")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Endpoint file (host on line 1, port on line 2)
    #[arg(long, global = true)]
    endpoint_file: Option<PathBuf>,

    /// Server host, overrides the endpoint file
    #[arg(long, global = true, requires = "port")]
    host: Option<String>,

    /// Server port, overrides the endpoint file
    #[arg(long, global = true, requires = "host")]
    port: Option<u16>,

    /// Save image file acting as the chip
    #[arg(long, global = true)]
    image: Option<PathBuf>,

    /// Chip type code of the image
    #[arg(long, global = true)]
    kind: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send the save chip contents to the server
    Dump,

    /// Receive an image from the server and write it to the save chip
    Restore,

    /// Wait for commands on stdin: d/a dump, r/b restore, q quit
    Interactive,

    /// Accept one connection and store or serve a save file
    #[command(group(ArgGroup::new("mode").required(true).args(["store", "serve"])))]
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:8000")]
        bind: String,

        /// Store everything received into this file
        #[arg(long)]
        store: Option<PathBuf>,

        /// Send this file to the peer
        #[arg(long)]
        serve: Option<PathBuf>,
    },

    /// Show the effective endpoint and settings
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load settings
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::load_or_default(Settings::default_path())?,
    };
    if let Some(image) = &cli.image {
        settings.device.image = image.clone();
    }
    if let Some(kind) = cli.kind {
        settings.device.kind = kind;
    }

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        settings.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    // Validate settings
    settings.validate()?;

    match &cli.command {
        Commands::Dump => {
            let cancel = CancelToken::new();
            let mut controller = build_controller(&cli, &settings, cancel.clone())?;
            watch_ctrl_c(cancel);
            run_once(&mut controller, Direction::Send).await?;
        }
        Commands::Restore => {
            let cancel = CancelToken::new();
            let mut controller = build_controller(&cli, &settings, cancel.clone())?;
            watch_ctrl_c(cancel);
            run_once(&mut controller, Direction::Receive).await?;
        }
        Commands::Interactive => {
            let cancel = CancelToken::new();
            let mut controller = build_controller(&cli, &settings, cancel.clone())?;
            watch_ctrl_c(cancel.clone());
            interactive(&mut controller, &cancel).await?;
        }
        Commands::Serve { bind, store, serve } => {
            let mode = match (store, serve) {
                (Some(path), _) => ServeMode::Store(path.clone()),
                (None, Some(path)) => ServeMode::Serve(path.clone()),
                (None, None) => anyhow::bail!("one of --store or --serve is required"),
            };
            let moved = serve::run(bind, &mode).await?;
            println!("Done! {}", format_bytes(moved));
        }
        Commands::Status => {
            show_status(&cli, &settings);
        }
    }

    Ok(())
}

/// Endpoint from `--host/--port`, or the endpoint file
fn load_endpoint(cli: &Cli) -> Result<Endpoint, ConfigError> {
    match (&cli.host, cli.port) {
        (Some(host), Some(port)) => Endpoint::new(host.clone(), port),
        _ => {
            let path = cli
                .endpoint_file
                .clone()
                .unwrap_or_else(Settings::default_endpoint_path);
            Endpoint::load(path)
        }
    }
}

fn build_controller(
    cli: &Cli,
    settings: &Settings,
    cancel: CancelToken,
) -> anyhow::Result<SessionController<ImageDevice, TcpResolver>> {
    let endpoint = match load_endpoint(cli) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let e = savsend_core::Error::from(e);
            eprintln!("{}", style(e.status_message()).red());
            anyhow::bail!(e);
        }
    };

    let device = ImageDevice::new(settings.device.image.clone(), settings.device_kind());

    let mut resolver = TcpResolver::new();
    if let Some(timeout) = settings.connect_timeout() {
        resolver = resolver.with_connect_timeout(timeout);
    }

    let engine = TransferEngine::new(settings.engine_config())?.with_cancel(cancel);

    Ok(SessionController::new(
        device,
        resolver,
        Arc::new(endpoint),
        engine,
    ))
}

/// Cancel the running transfer on every Ctrl+C
fn watch_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Ctrl+C received, cancelling transfer");
            cancel.cancel();
        }
    });
}

/// Run one session with a progress bar and report the outcome
async fn run_session<D, R>(
    controller: &mut SessionController<D, R>,
    direction: Direction,
) -> Result<SessionReport, savsend_core::Error>
where
    D: BlockDevice,
    R: EndpointResolver,
{
    let progress = if console::user_attended_stderr() {
        TransferProgress::new(direction)
    } else {
        TransferProgress::hidden()
    };

    match controller
        .run(direction, |moved, total| progress.update(moved, total))
        .await
    {
        Ok(report) => {
            let verb = match direction {
                Direction::Send => "Dumped",
                Direction::Receive => "Restored",
            };
            progress.finish_with_message(format!(
                "{verb} {} ({}) in {}, {} calls, {}",
                format_bytes(u64::from(report.size)),
                report.kind,
                format_duration(report.elapsed),
                report.transfer.calls,
                format_speed(report.transfer.bytes_per_sec()),
            ));
            Ok(report)
        }
        Err(e) => {
            progress.abandon();
            report_error(&e);
            Err(e)
        }
    }
}

async fn run_once<D, R>(
    controller: &mut SessionController<D, R>,
    direction: Direction,
) -> anyhow::Result<()>
where
    D: BlockDevice,
    R: EndpointResolver,
{
    run_session(controller, direction).await?;
    println!("Done!");
    Ok(())
}

/// Command loop over stdin
async fn interactive<D, R>(
    controller: &mut SessionController<D, R>,
    cancel: &CancelToken,
) -> anyhow::Result<()>
where
    D: BlockDevice,
    R: EndpointResolver,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Server is at {}", controller.endpoint());

    loop {
        println!();
        println!("Ready. [d] dump  [r] restore  [q] quit");

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let direction = match line.trim().to_lowercase().as_str() {
            "d" | "a" | "dump" => Direction::Send,
            "r" | "b" | "restore" => Direction::Receive,
            "q" | "quit" => break,
            "" => continue,
            other => {
                eprintln!("{}", style(format!("Unknown command: {other}")).yellow());
                continue;
            }
        };

        cancel.reset();
        if run_session(controller, direction).await.is_ok() {
            println!("Done!");
        }
    }

    Ok(())
}

fn report_error(e: &savsend_core::Error) {
    eprintln!("{}", style(e.status_message()).red());
    if e.device_state_undefined() {
        eprintln!(
            "{}",
            style("The save chip contents are undefined. Restore again before using it.")
                .red()
                .bold()
        );
    }
}

/// Show endpoint and settings
fn show_status(cli: &Cli, settings: &Settings) {
    println!("savsend Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Endpoint:");
    match load_endpoint(cli) {
        Ok(endpoint) => println!("  Server: {endpoint}"),
        Err(e) => println!("  {}", style(e.to_string()).red()),
    }
    println!();

    println!("Transfer:");
    println!(
        "  Max chunk: {}",
        format_bytes(settings.transfer.max_chunk as u64)
    );
    match settings.engine_config().pacing {
        savsend_core::Pacing::Yield => println!("  Pacing: yield"),
        savsend_core::Pacing::Tick(period) => {
            println!("  Pacing: every {}", format_duration(period));
        }
    }
    match settings.connect_timeout() {
        Some(timeout) => println!("  Connect timeout: {}", format_duration(timeout)),
        None => println!("  Connect timeout: none"),
    }
    match settings.io_timeout() {
        Some(timeout) => println!("  I/O timeout: {}", format_duration(timeout)),
        None => println!("  I/O timeout: none (Ctrl+C to stop)"),
    }
    println!();

    println!("Device:");
    println!("  Image: {}", settings.device.image.display());
    println!("  Kind: {}", settings.device_kind());
    match std::fs::metadata(&settings.device.image) {
        Ok(meta) => println!("  Size: {}", format_bytes(meta.len())),
        Err(_) => println!("  {}", style("Image not found").yellow()),
    }
}
