//! Flightline CLI
//!
//! Chunked, flow-controlled peer-to-peer file transfer

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use flightline_core::{
    Direction, MemoryChannel, MemoryRelay, OutboundFile, SessionCoordinator, SessionEvent,
    SessionHandle, TransferId,
};
use flightline_files::{BufferTier, is_hazardous};
use indicatif::MultiProgress;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferBar, format_bytes};

/// How long loopback setup steps may take
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Flightline - peer-to-peer file transfer that survives flaky networks
#[derive(Parser)]
#[command(name = "flightline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files between two in-process peers
    Loopback {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory for received files
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Report whether file names are executable-like
    Classify {
        /// File names to check
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose {
            "debug"
        } else {
            config.flight.logging.level.as_str()
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Loopback { files, output } => loopback(files, output, &config).await?,
        Commands::Classify { names } => classify(&names),
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Print the hazard classification of each name
fn classify(names: &[String]) {
    for name in names {
        if is_hazardous(name) {
            println!("{}: {}", name, style("hazardous").red().bold());
        } else {
            println!("{}: {}", name, style("ok").green());
        }
    }
}

/// One side of the loopback
struct Peer {
    handle: SessionHandle,
    events: UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl Peer {
    fn start(config: &Config, name: &str, relay: &MemoryRelay, buffer: BufferTier) -> anyhow::Result<Self> {
        let (link, link_events) = relay.link();
        let (coordinator, handle, events) =
            SessionCoordinator::new(config.flight.clone(), name, Box::new(link), link_events, buffer)?;
        let task = tokio::spawn(coordinator.run());
        Ok(Self {
            handle,
            events,
            task,
        })
    }

    /// Wait for the first event `pick` accepts, dropping the rest
    async fn wait_for<T>(
        &mut self,
        what: &str,
        mut pick: impl FnMut(SessionEvent) -> Option<T>,
    ) -> anyhow::Result<T> {
        let events = &mut self.events;
        tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::SessionFailed(e) = &event {
                    anyhow::bail!("session failed while waiting for {what}: {e}");
                }
                if let Some(found) = pick(event) {
                    return Ok(found);
                }
            }
            anyhow::bail!("session stopped while waiting for {what}")
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {what}"))?
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        self.task.await?;
        Ok(())
    }
}

/// Pair two coordinators through an in-process relay and send `files` across
async fn loopback(files: Vec<PathBuf>, output: PathBuf, config: &Config) -> anyhow::Result<()> {
    let mut outbound = Vec::with_capacity(files.len());
    for path in &files {
        let file = OutboundFile::from_path(path)
            .await
            .with_context(|| format!("cannot send {}", path.display()))?;
        outbound.push(file);
    }

    let relay = MemoryRelay::new();
    let name = &config.identity.display_name;
    let mut host = Peer::start(config, name, &relay, BufferTier::in_memory())?;
    let mut guest = Peer::start(
        config,
        &format!("{name}-receiver"),
        &relay,
        config.flight.buffer.open_tier(),
    )?;

    host.handle.connect().await?;
    guest.handle.connect().await?;
    host.wait_for("registration", |e| matches!(e, SessionEvent::Registered { .. }).then_some(()))
        .await?;
    guest
        .wait_for("registration", |e| matches!(e, SessionEvent::Registered { .. }).then_some(()))
        .await?;

    host.handle.create_flight().await?;
    let code = host
        .wait_for("flight code", |e| match e {
            SessionEvent::FlightCreated { flight_code } => Some(flight_code),
            _ => None,
        })
        .await?;
    println!("Flight: {}", style(&code).bold());

    guest.handle.join_flight(code).await?;
    let peer = host
        .wait_for("peer", |e| match e {
            SessionEvent::PeerJoined { peer, .. } => Some(peer),
            _ => None,
        })
        .await?;
    println!("Peer joined: {} ({})", peer.name, peer.id);

    // Exchange one setup payload through the relay, as a real offer would travel
    host.handle
        .send_signal(serde_json::json!({ "offer": "loopback" }))
        .await?;
    guest
        .wait_for("channel offer", |e| matches!(e, SessionEvent::Signal(_)).then_some(()))
        .await?;

    let (host_end, guest_end) = MemoryChannel::pair();
    guest.handle.attach_channel(guest_end).await?;
    host.handle.attach_channel(host_end).await?;

    let total: u64 = outbound.iter().map(|f| f.size).sum();
    println!(
        "Sending {} file(s), {}",
        outbound.len(),
        format_bytes(total)
    );
    let ids = host.handle.enqueue(outbound).await?;

    let result = run_transfers(&mut host, &mut guest, ids.len(), &output).await;

    host.stop().await?;
    guest.stop().await?;
    result
}

/// Outcome counts for one loopback run
#[derive(Debug, Default)]
struct Tally {
    expected: usize,
    sent: usize,
    send_failures: usize,
    received: usize,
    receive_failures: usize,
}

impl Tally {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    fn send_finished(&mut self, ok: bool) {
        if ok {
            self.sent += 1;
        } else {
            self.send_failures += 1;
        }
    }

    fn receive_finished(&mut self, ok: bool) {
        if ok {
            self.received += 1;
        } else {
            self.receive_failures += 1;
        }
    }

    /// Every send resolved and every delivered send has a receive-side outcome
    fn is_done(&self) -> bool {
        self.sent + self.send_failures >= self.expected
            && self.received + self.receive_failures >= self.sent
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.send_failures > 0 || self.receive_failures > 0 {
            anyhow::bail!(
                "{} of {} send(s) failed, {} receive(s) failed or were discarded",
                self.send_failures,
                self.expected,
                self.receive_failures
            );
        }
        Ok(())
    }
}

async fn run_transfers(
    host: &mut Peer,
    guest: &mut Peer,
    expected: usize,
    output: &Path,
) -> anyhow::Result<()> {
    let multi = MultiProgress::new();
    let mut bars: HashMap<(Direction, TransferId), TransferBar> = HashMap::new();
    let mut tally = Tally::new(expected);

    while !tally.is_done() {
        tokio::select! {
            Some(event) = host.events.recv() => match event {
                SessionEvent::TransferStarted { id, name, size, direction } => {
                    bars.insert((direction, id), TransferBar::new(&multi, size, &name, direction));
                }
                SessionEvent::TransferProgress(p) => {
                    if let Some(bar) = bars.get(&(p.direction, p.transfer_id)) {
                        bar.update(&p);
                    }
                }
                SessionEvent::TransferCompleted { id, direction, .. } => {
                    if let Some(bar) = bars.remove(&(direction, id)) {
                        bar.finish();
                    }
                    tally.send_finished(true);
                }
                SessionEvent::TransferFailed { id, name, direction, error } => {
                    if let Some(bar) = bars.remove(&(direction, id)) {
                        bar.abandon(&error.to_string());
                    }
                    tracing::warn!("Send of {} failed: {}", name, error);
                    tally.send_finished(false);
                }
                SessionEvent::SessionFailed(e) => anyhow::bail!("sender session failed: {e}"),
                _ => {}
            },
            Some(event) = guest.events.recv() => match event {
                SessionEvent::TransferStarted { id, name, size, direction } => {
                    bars.insert((direction, id), TransferBar::new(&multi, size, &name, direction));
                }
                SessionEvent::TransferProgress(p) => {
                    if let Some(bar) = bars.get(&(p.direction, p.transfer_id)) {
                        bar.update(&p);
                    }
                }
                SessionEvent::TransferCompleted { id, direction, .. } => {
                    if let Some(bar) = bars.remove(&(direction, id)) {
                        bar.finish();
                    }
                }
                SessionEvent::TransferFailed { id, name, direction, error } => {
                    if let Some(bar) = bars.remove(&(direction, id)) {
                        bar.abandon(&error.to_string());
                    }
                    tracing::warn!("Receive of {} failed: {}", name, error);
                    tally.receive_finished(false);
                }
                SessionEvent::TransferDiscarded { name, bytes_received, .. } => {
                    tracing::warn!("Discarded partial {} after {} bytes", name, bytes_received);
                    tally.receive_finished(false);
                }
                SessionEvent::FileReceived { file, hazardous } => {
                    let path = file
                        .persist_to(output)
                        .await
                        .with_context(|| format!("cannot write {}", file.name))?;
                    let marker = if hazardous {
                        style(" [hazardous: not opened]").red().to_string()
                    } else {
                        String::new()
                    };
                    multi.suspend(|| {
                        println!("Received {} ({}) -> {}{}", file.name, format_bytes(file.size), path.display(), marker);
                    });
                    tally.receive_finished(true);
                }
                SessionEvent::BatchComplete { count } => {
                    tracing::info!("Batch of {} file(s) complete", count);
                }
                SessionEvent::ProtocolViolation(error) => {
                    tracing::warn!("{}", error);
                }
                SessionEvent::SessionFailed(e) => anyhow::bail!("receiver session failed: {e}"),
                _ => {}
            },
            else => anyhow::bail!("sessions stopped before all transfers finished"),
        }
    }

    tally.check()?;
    println!("{}", style("All transfers complete").green().bold());
    Ok(())
}
