//! spot-relay CLI - decode local receivers, follow a skimmer, serve one feed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use spot_relay::{
    audio::spawn_pcm_reader,
    client::{SkimmerClient, SkimmerStatus},
    config::Config,
    decode::{ExternalDecoder, Orchestrator},
    dispatch::SpotDispatcher,
    geo::{Enricher, PrefixTable},
    hub::FanoutHub,
    server::{self, AppState},
    sinks::{HttpReportSink, ReportSink, SpotLog},
    stats::PipelineStats,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// spot-relay - merge decoded and skimmer spots into one WebSocket feed
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, env = "SPOT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Station callsign, also used for the skimmer login
    #[arg(short, long, env = "SPOT_RELAY_CALLSIGN")]
    callsign: Option<String>,

    /// Address for the subscriber and metrics server
    #[arg(long, env = "SPOT_RELAY_LISTEN")]
    listen: Option<String>,

    /// Skimmer server hostname
    #[arg(long, env = "SPOT_RELAY_SKIMMER_HOST")]
    skimmer_host: Option<String>,

    /// Skimmer server port
    #[arg(long, env = "SPOT_RELAY_SKIMMER_PORT")]
    skimmer_port: Option<u16>,

    /// Do not connect to the skimmer
    #[arg(long)]
    no_skimmer: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log statistics every N seconds (0 = never)
    #[arg(short, long, default_value_t = 300)]
    stats_interval: u64,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(ref callsign) = self.callsign {
            config.callsign = callsign.to_uppercase();
        }
        if let Some(ref listen) = self.listen {
            config.listen = listen.clone();
        }
        if let Some(ref host) = self.skimmer_host {
            config.skimmer.host = host.clone();
        }
        if let Some(port) = self.skimmer_port {
            config.skimmer.port = port;
        }
        if self.no_skimmer {
            config.skimmer.enabled = false;
        }
    }
}

/// Build the hub and subscribe it to every dispatched spot.
fn build_hub(
    config: &Config,
    stats: &Arc<PipelineStats>,
    skimmer: Option<SkimmerStatus>,
    dispatcher: &SpotDispatcher,
) -> FanoutHub {
    let bands = config
        .decoder
        .bands
        .iter()
        .map(|band| band.name.clone())
        .collect();
    let hub = FanoutHub::new(config.hub_config(), Arc::clone(stats), skimmer, bands);
    hub.attach(dispatcher.listeners());
    hub
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen))?;

    info!("spot-relay starting...");
    info!("Callsign: {}", config.callsign);

    let stats = Arc::new(PipelineStats::new());

    let table = match config.prefix_table {
        Some(ref path) => PrefixTable::load(path)
            .with_context(|| format!("Failed to load prefix table {}", path.display()))?,
        None => PrefixTable::new(),
    };
    info!("Prefix table: {} entries", table.len());
    let enricher = Enricher::new(Arc::new(table), config.receiver.position());

    let spot_log = config
        .spot_log_config()
        .map(SpotLog::open)
        .transpose()
        .context("Failed to open spot log")?
        .map(Arc::new);

    let mut reporters: Vec<Arc<dyn ReportSink>> = Vec::new();
    for sink in config.report_sink_configs() {
        let name = sink.name.clone();
        let reporter = HttpReportSink::new(sink)
            .with_context(|| format!("Failed to build reporting sink {}", name))?;
        reporters.push(Arc::new(reporter));
    }

    let dispatcher = SpotDispatcher::new(enricher, spot_log, reporters, Arc::clone(&stats));

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx_clone.send(true);
    });

    // Optional max runtime
    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(args.max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    // Periodic statistics
    if args.stats_interval > 0 {
        let stats_clone = Arc::clone(&stats);
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("\n{}", stats_clone.summary());
            }
        });
    }

    // The hub listens before any producer can dispatch.
    let skimmer = config
        .skimmer
        .enabled
        .then(|| SkimmerClient::new(config.skimmer_client_config(), dispatcher.clone()));
    if skimmer.is_some() {
        info!("Skimmer: {}:{}", config.skimmer.host, config.skimmer.port);
    }
    let hub = build_hub(
        &config,
        &stats,
        skimmer.as_ref().map(|client| client.status()),
        &dispatcher,
    );
    let hub_task = hub.spawn_background(shutdown_rx.clone());

    let orchestrator = Orchestrator::start(
        config.orchestrator_config(),
        Arc::new(ExternalDecoder::new()),
        dispatcher.clone(),
        shutdown_rx.clone(),
    )
    .context("Failed to start decoder orchestrator")?;

    let mut readers = Vec::new();
    for band in &config.decoder.bands {
        if let Some(ref input) = band.input
            && let Some(tx) = orchestrator.audio_sender(&band.name)
        {
            readers.push(spawn_pcm_reader(
                band.name.clone(),
                input.clone(),
                config.decoder.sample_rate,
                tx,
                shutdown_rx.clone(),
            ));
        }
    }

    let skimmer_task = skimmer.map(|client| client.spawn(shutdown_rx.clone()));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Subscribers: ws://{}/ws", listen);
    let server_task = tokio::spawn(server::serve_on(
        listener,
        AppState {
            hub,
            stats: Arc::clone(&stats),
        },
        shutdown_rx.clone(),
    ));

    let _ = shutdown_rx.wait_for(|stop| *stop).await;
    info!("Shutting down...");

    for reader in readers {
        let _ = reader.await;
    }
    orchestrator.join().await;
    if let Some(task) = skimmer_task {
        let _ = task.await;
    }
    let _ = hub_task.await;
    match server_task.await {
        Ok(Err(e)) => warn!("Server error: {}", e),
        Err(e) => warn!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    // Print final statistics
    println!("\n\nFINAL STATISTICS");
    println!("{}", stats.summary());

    Ok(())
}
