use anyhow::Result;
use dotenvy::dotenv;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use boss_dl::cli::{Cli, Commands};
use boss_dl::commands::{run_console, spawn_dispatcher, CONSOLE_HELP};
use boss_dl::core::{config, init_logger, log_startup_configuration, metrics, Requester, SchedulerConfig};
use boss_dl::download::{DownloadResult, QueueEvent, StrategySelector};
use boss_dl::scheduler::Scheduler;

/// Entry point for the boss-dl CLI
///
/// Parses CLI arguments and dispatches to the subcommand.
///
/// # Errors
/// Returns an error if logging cannot be initialised or the command fails.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present, before any config is read
    let _ = dotenv();

    let cli = Cli::parse_args();

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH, &config::LOG_LEVEL)?;
    metrics::init_metrics();

    let mut cfg = SchedulerConfig::from_env();
    if let Some(dir) = cli.output.as_deref() {
        cfg = cfg.download_dir(config::expand_path(dir));
    }
    if let Some(concurrency) = cli.concurrency {
        cfg = cfg.max_concurrent_downloads(concurrency);
    }

    match cli.command {
        Commands::Fetch { urls, requester, events } => run_fetch(cfg, urls, Requester(requester), events).await,
        Commands::Serve { events } => run_serve(cfg, events).await,
        Commands::Check { url } => run_check(&cfg, &url),
        Commands::Metrics => {
            print!("{}", metrics::gather_text());
            Ok(())
        }
    }
}

/// Prints every queue event as one JSON line.
fn spawn_event_printer(mut rx: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => log::warn!("⚠️ Event printer lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_result(result: &DownloadResult) {
    if result.success {
        println!(
            "✅ {} {} ({} bytes, {:.1}s, {})",
            result.item_id,
            result
                .output_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            result.bytes,
            result.duration.as_secs_f64(),
            result.strategy
        );
    } else if result.cancelled {
        println!("⏹️ {} cancelled", result.item_id);
    } else {
        println!(
            "❌ {} failed after {} attempt(s): {}",
            result.item_id,
            result.attempts,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

/// Queues the URLs and drives them through `DownloadManager::submit` until
/// all of them have finished.
async fn run_fetch(cfg: SchedulerConfig, urls: Vec<String>, requester: Requester, events: bool) -> Result<()> {
    // One local user submitting a batch should not trip the per-user cooldown
    let cfg = cfg.rate_limit_cooldown(Duration::ZERO);
    log_startup_configuration(&cfg);

    let scheduler = Arc::new(Scheduler::new(cfg));
    let printer = events.then(|| spawn_event_printer(scheduler.subscribe()));

    let mut queued = 0usize;
    for url in &urls {
        match scheduler.enqueue(url, requester).await {
            Ok(item) => {
                queued += 1;
                log::info!("Queued {} as {}", url, item.id);
            }
            Err(e) => println!("❌ {}: {}", url, e),
        }
    }

    let interrupt = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, cancelling downloads");
                let status = scheduler.status().await;
                for item in status.pending.iter().chain(status.active.iter()) {
                    scheduler.cancel(item.id).await;
                }
            }
        })
    };

    let manager = Arc::clone(scheduler.manager());
    let poll_interval = scheduler.config().poll_interval;
    let mut running = FuturesUnordered::new();
    let mut failures = 0usize;

    loop {
        if let Some(item) = manager.next_item().await {
            match manager.submit(item).await {
                Ok(handle) => running.push(handle),
                Err(e) if e.is_backpressure() => {
                    // Item is back at the head of the queue; wait for capacity
                    match running.next().await {
                        Some(done) => {
                            let result = done?;
                            failures += usize::from(!result.success);
                            print_result(&result);
                        }
                        None => tokio::time::sleep(poll_interval).await,
                    }
                }
                Err(e) => {
                    failures += 1;
                    println!("❌ {}", e);
                }
            }
        } else if let Some(done) = running.next().await {
            let result = done?;
            failures += usize::from(!result.success);
            print_result(&result);
        } else {
            break;
        }
    }

    interrupt.abort();
    drop(scheduler);
    if let Some(printer) = printer {
        printer.abort();
    }

    log::info!("Fetch finished: {} queued, {} failed", queued, failures);
    if failures > 0 || queued < urls.len() {
        anyhow::bail!("{} of {} download(s) did not succeed", failures + urls.len() - queued, urls.len());
    }
    Ok(())
}

/// Runs the scheduler behind the command channel, fed from stdin.
async fn run_serve(cfg: SchedulerConfig, events: bool) -> Result<()> {
    log_startup_configuration(&cfg);

    let scheduler = Arc::new(Scheduler::new(cfg));
    let printer = events.then(|| spawn_event_printer(scheduler.subscribe()));
    let worker_loop = scheduler.start();
    let (handle, dispatcher) = spawn_dispatcher(Arc::clone(&scheduler));

    log::info!("boss-dl serving on stdin");
    println!("{}", CONSOLE_HELP);

    let console = run_console(handle.clone(), BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    tokio::select! {
        result = console => result?,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, shutting down");
            let _ = handle.shutdown().await;
        }
    }

    dispatcher.await?;
    worker_loop.await?;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

fn run_check(cfg: &SchedulerConfig, url: &str) -> Result<()> {
    let selector = StrategySelector::with_defaults(cfg);
    let (url, selected) = selector.select_str(url)?;

    println!("url:      {}", url);
    println!("platform: {}", selected.platform);
    println!("primary:  {} ({})", selected.primary.name(), selected.primary.mode());
    match &selected.fallback {
        Some(fallback) => println!("fallback: {} ({})", fallback.name(), fallback.mode()),
        None => println!("fallback: none"),
    }
    Ok(())
}
