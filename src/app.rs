//! Core application runner for `switchbot-exporter`.
//!
//! Ingestion is decoupled from the Bluetooth stack and from process exit
//! codes: advertisements come from an injected [`Scanner`], so the whole path
//! from raw bytes to exported metrics can be tested without hardware.

use crate::alias::Alias;
use crate::decoder::{self, Decoded};
use crate::output::collector;
use crate::scanner::{Advertisement, Backend, ScanError, ScanSchedule};
use crate::store::{DEFAULT_STALE_AFTER, DeviceStateStore};
use clap::Parser;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Export SwitchBot Meter and Curtain readings as Prometheus metrics.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Address the metrics endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:9012")]
    pub listen: SocketAddr,

    /// Hide devices not heard from for this long.
    /// Accepts duration with suffix: 30s, 2m, 500ms, 1h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "60s", value_parser = crate::duration::parse_duration)]
    pub stale_after: Duration,

    /// How long each scan window lasts.
    #[arg(long, default_value = "11s", value_parser = crate::duration::parse_duration)]
    pub scan_window: Duration,

    /// Pause between scan windows; 0 scans continuously.
    #[arg(long, default_value = "49s", value_parser = crate::duration::parse_duration)]
    pub scan_idle: Duration,

    /// Specify human-readable alias for a device address.
    /// Format: --alias C4:7C:8D:6A:01:0F=Bedroom
    #[arg(long = "alias", value_parser = crate::alias::parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// Verbose output, log advertisements that were not recognized
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

impl Options {
    pub fn schedule(&self) -> ScanSchedule {
        ScanSchedule {
            window: self.scan_window,
            idle: self.scan_idle,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        let schedule = ScanSchedule::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9012)),
            stale_after: DEFAULT_STALE_AFTER,
            scan_window: schedule.window,
            scan_idle: schedule.idle,
            aliases: Vec::new(),
            verbose: false,
            backend: Backend::default(),
        }
    }
}

/// Errors returned by the application.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        schedule: ScanSchedule,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>,
    >;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        schedule: ScanSchedule,
    ) -> Pin<
        Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>,
    > {
        Box::pin(async move { crate::scanner::start_scan(backend, schedule).await })
    }
}

/// Decode one advertisement and store every recognized reading.
///
/// Returns the number of readings stored. Anything not recognized is logged
/// at `DEBUG` level and dropped.
pub fn ingest(store: &DeviceStateStore, advertisement: &Advertisement, now: Instant) -> usize {
    let mut stored = 0;

    for decoded in decoder::decode(&advertisement.services, &advertisement.service_data) {
        match decoded {
            Decoded::Recognized(reading) => {
                tracing::trace!(address = %advertisement.address, ?reading, "reading");
                store.upsert(advertisement.address, reading, now);
                stored += 1;
            }
            Decoded::Ignored(reason) => {
                tracing::debug!(address = %advertisement.address, %reason, "ignored advertisement");
            }
        }
    }

    stored
}

/// Feed advertisements from `scanner` into `store` until the scanner stops.
///
/// Returns the number of readings stored.
pub async fn run_ingest(
    options: &Options,
    scanner: &dyn Scanner,
    store: &DeviceStateStore,
) -> Result<usize, RunError> {
    let mut advertisements = scanner
        .start_scan(options.backend, options.schedule())
        .await?;

    let mut stored = 0;
    while let Some(advertisement) = advertisements.recv().await {
        stored += ingest(store, &advertisement, Instant::now());
    }

    tracing::info!(stored, "advertisement stream ended");
    Ok(stored)
}

/// Run the exporter: serve metrics on `options.listen` while ingesting.
///
/// Returns when either the scanner stops or the HTTP server fails; a bind
/// failure is reported as [`RunError::Io`].
pub async fn run(options: Options, scanner: &dyn Scanner) -> Result<(), RunError> {
    let store = Arc::new(DeviceStateStore::new());
    let aliases = crate::alias::to_map(&options.aliases);
    let registry = collector::registry(Arc::clone(&store), options.stale_after, aliases)?;

    let server = crate::http::serve(options.listen, registry);
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.map_err(RunError::from),
        result = run_ingest(&options, scanner, &store) => result.map(|_| ()),
    }
}
