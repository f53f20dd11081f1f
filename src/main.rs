use anyhow::Result;
use clap::Parser;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use connwatch::backends::Platform;
use connwatch::backends::actions::{ChannelTaskQueue, SystemTerminator};
use connwatch::backends::connection_table::{detect_table_backends, select_table_backend};
use connwatch::backends::identity::SysinfoResolver;
use connwatch::config::Config;
use connwatch::connection::{EnrichedConnection, format_details};
use connwatch::monitor::{LiveMonitor, spawn_polling};
use connwatch::projection::{SortDirection, SortField, SortableProjection};
use connwatch::snapshot::ConnectionSnapshotService;

/// ConnWatch - live TCP connections with their owning processes
#[derive(Parser, Debug)]
#[command(name = "connwatch")]
#[command(version = "0.3.0")]
#[command(about = "Live TCP connection monitor with per-process kill and block actions", long_about = None)]
struct Args {
    /// Connection table backend to use
    #[arg(long, value_name = "BACKEND")]
    backend: Option<String>,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,

    /// Refresh interval in milliseconds (saved for next time)
    #[arg(long, value_name = "MS")]
    interval: Option<u64>,

    /// Sort column
    #[arg(long, value_enum, value_name = "FIELD")]
    sort: Option<SortField>,

    /// Sort descending instead of ascending - requires --sort
    #[arg(long, requires = "sort")]
    descending: bool,

    /// Print one snapshot and exit
    #[arg(long)]
    once: bool,

    /// Print the detailed per-row block instead of the table
    #[arg(long)]
    details: bool,

    /// Kill the process owning these connections
    #[arg(long, value_name = "PID", conflicts_with = "block")]
    kill: Option<u32>,

    /// Queue block rules for every remote address this PID talks to
    #[arg(long, value_name = "PID")]
    block: Option<u32>,
}

fn print_available_backends() {
    println!("ConnWatch v0.3.0 - Available Backends ({:?})\n", Platform::current());

    println!("Connection Table Backends:");
    let backends = detect_table_backends();
    if backends.is_empty() {
        println!("  (none compiled in)");
    } else {
        for backend in backends {
            let status = if backend.available {
                "available"
            } else {
                "unavailable"
            };
            println!(
                "  {:20} [priority: {:?}] {}",
                backend.name, backend.priority, status
            );
            if backend.available {
                match select_table_backend(Some(backend.name)) {
                    Ok(instance) => println!("  {:20} supports: {}", "", instance.capabilities()),
                    Err(e) => println!("  {:20} failed to initialize: {:#}", "", e),
                }
            }
        }
    }

    println!();
    println!("Usage:");
    println!("  Watch Mode:");
    println!("    connwatch [--backend <name>] [--interval <ms>] [--sort <field> [--descending]]");
    println!();
    println!("  One-shot Mode:");
    println!("    connwatch --once [--details]");
    println!("    connwatch --kill <PID>");
    println!("    connwatch --block <PID>");
}

/// Warn when other users' sockets can't be attributed to their owners
fn warn_if_unprivileged() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        if unsafe { libc::geteuid() } != 0 {
            log::warn!("Not running as root; sockets owned by other users will show pid 0");
        }
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut short: String = text.chars().take(width.saturating_sub(1)).collect();
        short.push('~');
        short
    }
}

fn print_connections(rows: &[EnrichedConnection]) {
    println!(
        "{:<32} {:>7} {:<46} {:<46} {:<12}",
        "PROCESS", "PID", "LOCAL", "REMOTE", "STATE"
    );
    for row in rows {
        println!(
            "{:<32} {:>7} {:<46} {:<46} {:<12}",
            truncate(&row.display_name(), 32),
            row.pid(),
            row.record.local.to_string(),
            row.record.remote.to_string(),
            row.state().as_str(),
        );
    }
    println!("{} connection(s)", rows.len());
}

fn render(rows: &[EnrichedConnection], details: bool) {
    if details {
        println!("{}", format_details(rows));
    } else {
        print_connections(rows);
    }
}

/// Rows owned by `pid`
fn rows_for_pid(rows: &[EnrichedConnection], pid: u32) -> Result<Vec<EnrichedConnection>> {
    let owned: Vec<EnrichedConnection> = rows.iter().filter(|row| row.pid() == pid).cloned().collect();

    if owned.is_empty() {
        anyhow::bail!("No TCP connections owned by PID {}", pid);
    }
    Ok(owned)
}

/// Single-cycle modes: --once, --kill, --block
fn run_one_shot(args: &Args, monitor: &LiveMonitor, projection: &SortableProjection) -> Result<()> {
    monitor.start();
    let outcome = monitor.refresh();
    log::debug!("One-shot refresh: {:?}", outcome);
    let snapshot = monitor.current();
    monitor.stop();

    if let Some(pid) = args.kill {
        let rows = rows_for_pid(&snapshot, pid)?;
        monitor.kill_process(&rows[0])?;
        println!("Killed {} (PID {})", rows[0].display_name(), pid);
    } else if let Some(pid) = args.block {
        let rows = rows_for_pid(&snapshot, pid)?;
        let remotes: BTreeSet<IpAddr> = rows
            .iter()
            .map(|row| row.remote_address())
            .filter(|addr| !addr.is_unspecified())
            .collect();

        if remotes.is_empty() {
            println!("PID {} has no remote peers to block", pid);
        }
        for remote in remotes {
            if let Some(row) = rows.iter().find(|row| row.remote_address() == remote) {
                monitor.create_block_rule(row);
            }
        }
    } else {
        render(&projection.apply(&snapshot), args.details);
    }

    Ok(())
}

/// Reprint the list on every publish until Ctrl+C
async fn run_watch(
    args: &Args,
    monitor: Arc<LiveMonitor>,
    projection: &SortableProjection,
    config: &Config,
) -> Result<()> {
    let mut updates = monitor.subscribe();
    let poller = spawn_polling(Arc::clone(&monitor), config.refresh_interval());

    println!(
        "Watching TCP connections via {} every {:?} (Ctrl+C to stop)",
        monitor.backend_name(),
        config.refresh_interval()
    );

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let rows = projection.apply(&updates.borrow_and_update());
                println!("\n[{}]", chrono::Local::now().format("%H:%M:%S"));
                render(&rows, args.details);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, stopping...");
                break;
            }
        }
    }

    monitor.stop();
    if let Err(e) = poller.await {
        log::warn!("Polling task ended abnormally: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    // Handle --list-backends
    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let mut config = Config::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });
    if let Some(ms) = args.interval {
        config.refresh_interval_ms = ms;
    }

    warn_if_unprivileged();

    let preference = args
        .backend
        .as_deref()
        .or(config.preferred_backend.as_deref());
    let backend = select_table_backend(preference)?;
    log::info!(
        "Using connection table backend {} ({})",
        backend.name(),
        backend.capabilities()
    );

    let mut projection = SortableProjection::from_config(&config);
    if let Some(field) = args.sort {
        let direction = if args.descending {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        };
        projection.sort_by(field, direction);
    }

    // Queued firewall work is printed for whatever applies the rules
    let (queue, mut tasks) = ChannelTaskQueue::new();
    let consumer = tokio::spawn(async move {
        while let Some(task) = tasks.recv().await {
            match serde_json::to_string_pretty(&task) {
                Ok(json) => println!("Queued firewall task:\n{}", json),
                Err(e) => log::warn!("Failed to serialize firewall task: {}", e),
            }
        }
    });

    let monitor = Arc::new(
        LiveMonitor::new(
            ConnectionSnapshotService::new(backend),
            Box::new(SysinfoResolver::new()),
            Box::new(SystemTerminator),
            Box::new(queue),
        )
        .with_protected_process_name(config.protected_process_name.clone()),
    );

    let res = if args.once || args.kill.is_some() || args.block.is_some() {
        run_one_shot(&args, &monitor, &projection)
    } else {
        let res = run_watch(&args, Arc::clone(&monitor), &projection, &config).await;

        projection.store(&mut config);
        if let Err(e) = config.save() {
            log::warn!("Failed to save config: {:#}", e);
        }
        res
    };

    // Closing the queue lets the consumer drain and exit
    drop(monitor);
    if let Err(e) = consumer.await {
        log::warn!("Task consumer ended abnormally: {}", e);
    }

    res
}
