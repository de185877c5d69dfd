mod catalog;
mod progress;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use grab_engine::{
    Engine, EngineConfig, GrabError, MetadataSink, Scheduler, ShowDescriptor, ShowProvider,
};

#[derive(Parser)]
#[command(name = "rewind", version, about = "Catch-up TV acquisition tool")]
struct Args {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Concurrent segment transfers per job
    #[arg(long, default_value_t = 2, global = true)]
    transfers: usize,

    /// Concurrent acquisition jobs
    #[arg(long, default_value_t = 2, global = true)]
    jobs: usize,

    /// Remuxer binary (defaults to FFMPEG_PATH, then ffmpeg)
    #[arg(long, global = true)]
    ffmpeg: Option<String>,

    /// Kill the remuxer if it reports no progress for this many seconds
    #[arg(long, default_value_t = 60, global = true)]
    stall_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a single show from a stream manifest
    Grab {
        /// Manifest URL (or direct stream URL with --direct)
        url: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Title written into the container metadata
        #[arg(long)]
        title: Option<String>,

        /// Treat the URL as an already-muxed stream instead of a manifest
        #[arg(long)]
        direct: bool,
    },
    /// Run a scheduling pass over a JSON catalog of matched shows
    Run {
        /// Catalog file: a JSON array of show descriptors
        #[arg(long)]
        catalog: PathBuf,

        /// Directory that relative catalog output paths resolve against
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default_directive = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn interrupt_cancels(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn run(args: Args) -> Result<(), GrabError> {
    let config = EngineConfig {
        transfer_tokens: args.transfers.max(1),
        job_workers: args.jobs.max(1),
        stall_timeout: Duration::from_secs(args.stall_timeout.max(1)),
        ffmpeg_path: args.ffmpeg.clone(),
        ..Default::default()
    };

    let ffmpeg = process_utils::resolve_ffmpeg(config.ffmpeg_path.as_deref());
    if !process_utils::ffmpeg_available(&ffmpeg) {
        warn!(binary = %ffmpeg, "Remuxer binary not found; combining will fail");
    }

    let engine = Arc::new(Engine::new(config)?);

    match args.command {
        Commands::Grab {
            url,
            output,
            title,
            direct,
        } => {
            let title = title.unwrap_or_else(|| {
                output
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| url.clone())
            });
            let show = ShowDescriptor {
                id: url.clone(),
                title: title.clone(),
                manifest_url: url,
                output,
                synopsis: None,
                show_name: None,
                channel: None,
                episode_image: None,
                show_image: None,
            };

            let cancel = CancellationToken::new();
            interrupt_cancels(cancel.clone());

            let sink = Arc::new(progress::BarSink::new(&title));
            let outcome = if direct {
                engine.run_direct_job(&show, sink, &cancel).await?
            } else {
                engine.run_job(&show, sink, &cancel).await?
            };
            info!(
                output = %outcome.output.display(),
                bytes = outcome.bytes_downloaded,
                "Download complete"
            );
        }
        Commands::Run { catalog, dest } => {
            let provider =
                Arc::new(catalog::JsonCatalog::new(catalog, dest)) as Arc<dyn ShowProvider>;
            let metadata = Arc::new(catalog::JsonSidecarSink) as Arc<dyn MetadataSink>;

            let scheduler = Scheduler::new(engine);
            interrupt_cancels(scheduler.cancel_token());

            let bars = progress::BarFactory::new();
            let summary = scheduler
                .run_pass(&[provider], metadata, &|show| bars.sink(&show.title))
                .await;

            println!(
                "{} submitted, {} completed, {} failed, {} skipped",
                summary.submitted, summary.completed, summary.failed, summary.skipped
            );
            if summary.failed > 0 {
                process::exit(2);
            }
        }
    }

    Ok(())
}
