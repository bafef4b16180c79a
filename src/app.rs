//! Core application runner (business logic) for `heartband-relay`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with an injected scanner and forwarder.

use crate::advertisement::Advertisement;
use crate::decoder::{DEVICE_NAME_PATTERN, DecodeError, decode_heart_rate};
use crate::filter::ArrivalFilter;
use crate::forwarder::{DEFAULT_COLLECTOR_URL, ForwardError, Forwarder, HttpForwarder};
use crate::scanner::{AdvertisementResult, Backend, ScanError};
use crate::shutdown::Shutdown;
use clap::Parser;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the relay.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Collector endpoint receiving `?bpm=<n>` requests.
    #[arg(long, default_value = DEFAULT_COLLECTOR_URL)]
    pub collector_url: String,

    /// Give up on a forward attempt after this long.
    /// Accepts duration with suffix: 3s, 500ms, 1m.
    #[arg(long, default_value = "3s", value_parser = crate::duration::parse_duration)]
    pub forward_timeout: Duration,

    /// Substring of the advertised name identifying the band.
    #[arg(long, default_value = DEVICE_NAME_PATTERN)]
    pub device_name: String,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log decode anomalies and skipped readings
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the scan controller.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Forwarder(#[from] ForwardError),
    /// The controller only ever runs one session
    #[error("scan session cannot be started: session is {0}")]
    InvalidState(SessionState),
}

/// Boxed future returned by [`Scanner`] operations.
pub type ScanFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    /// Check that the radio is present and enabled.
    fn check_available(&self, backend: Backend) -> ScanFuture<'_, ()>;

    /// Start receiving advertisements. Closing the receiver stops the scan.
    fn start_scan(&self, backend: Backend) -> ScanFuture<'_, mpsc::Receiver<AdvertisementResult>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn check_available(&self, backend: Backend) -> ScanFuture<'_, ()> {
        Box::pin(crate::scanner::check_available(backend))
    }

    fn start_scan(&self, backend: Backend) -> ScanFuture<'_, mpsc::Receiver<AdvertisementResult>> {
        Box::pin(crate::scanner::start_scan(backend))
    }
}

/// Lifecycle of the single scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Active,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unstarted => write!(f, "unstarted"),
            SessionState::Active => write!(f, "active"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters for one scan session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Advertisements delivered by the scanner
    pub received: u64,
    /// Advertisements that passed the arrival filter
    pub accepted: u64,
    /// Advertisements dropped by the arrival filter
    pub suppressed: u64,
    /// Heart rate samples decoded
    pub samples: u64,
    /// Forward attempts acknowledged by the collector
    pub forwarded: u64,
    /// Forward attempts that failed
    pub failed: u64,
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} advertisements ({} accepted, {} suppressed), {} samples, {} forwarded, {} failed",
            self.received, self.accepted, self.suppressed, self.samples, self.forwarded, self.failed
        )
    }
}

/// Owner of the scan session: routes every advertisement through
/// arrival filter, decoder and forwarder, one at a time.
pub struct ScanController<'a> {
    scanner: &'a dyn Scanner,
    forwarder: &'a dyn Forwarder,
    backend: Backend,
    device_name: String,
    state: SessionState,
}

impl<'a> ScanController<'a> {
    pub fn new(
        scanner: &'a dyn Scanner,
        forwarder: &'a dyn Forwarder,
        backend: Backend,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            scanner,
            forwarder,
            backend,
            device_name: device_name.into(),
            state: SessionState::Unstarted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the scan session until `shutdown` is requested or the scanner fails.
    ///
    /// - Fails without starting a session if the radio is unavailable.
    /// - Returns the session counters on an orderly stop.
    /// - Returns the scanner's error after stopping if the subsystem fails while active.
    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<RelayStats, RunError> {
        if self.state != SessionState::Unstarted {
            return Err(RunError::InvalidState(self.state));
        }

        info!("Checking Bluetooth availability...");
        self.scanner.check_available(self.backend).await?;

        info!("Listening for {} advertisements...", self.device_name);
        let mut events = self.scanner.start_scan(self.backend).await?;
        self.state = SessionState::Active;
        info!("Scanner started. Waiting for band broadcasts...");

        // Ledger lives exactly as long as the session
        let mut filter = ArrivalFilter::default();
        let mut stats = RelayStats::default();

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => break Ok(()),
                event = events.recv() => event,
            };

            match event {
                Some(Ok(advertisement)) => {
                    self.route(&mut filter, &mut stats, advertisement).await;
                }
                Some(Err(e)) => break Err(e),
                None => break Err(ScanError::Bluetooth("scanner stopped unexpectedly".into())),
            }
        };

        info!("Stopping scanner...");
        events.close();
        drop(events);
        self.state = SessionState::Stopped;

        match outcome {
            Ok(()) => {
                info!("Scanner stopped. {stats}");
                Ok(stats)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Push one advertisement through the pipeline.
    async fn route(
        &self,
        filter: &mut ArrivalFilter,
        stats: &mut RelayStats,
        advertisement: Advertisement,
    ) {
        stats.received += 1;

        if !filter.accept(&advertisement.source, advertisement.observed_at) {
            stats.suppressed += 1;
            return;
        }
        stats.accepted += 1;

        for result in decode_heart_rate(&advertisement, &self.device_name) {
            match result {
                Ok(sample) => {
                    stats.samples += 1;
                    info!("[{}] Received heart rate: {} bpm", sample.source, sample.bpm);

                    if sample.bpm == 0 {
                        debug!("[{}] Skipping zero reading", sample.source);
                        continue;
                    }

                    match self.forwarder.forward(sample.bpm).await {
                        Ok(()) => {
                            stats.forwarded += 1;
                            info!("Successfully sent BPM {} to collector", sample.bpm);
                        }
                        Err(e) => {
                            stats.failed += 1;
                            warn!("Failed to send BPM {}: {e}", sample.bpm);
                        }
                    }
                }
                Err(e @ DecodeError::PayloadTooShort { .. }) => warn!("{e}"),
                Err(e @ DecodeError::MissingPayload(_)) => debug!("{e}"),
            }
        }
    }
}

/// Run the relay with the HTTP forwarder described by `options`.
pub async fn run(
    options: &Options,
    scanner: &dyn Scanner,
    shutdown: &Shutdown,
) -> Result<RelayStats, RunError> {
    let forwarder = HttpForwarder::new(&options.collector_url, options.forward_timeout)?;
    info!(
        "Forwarding readings to {} (timeout {:?})",
        forwarder.url(),
        options.forward_timeout
    );

    let mut controller =
        ScanController::new(scanner, &forwarder, options.backend, options.device_name.clone());
    controller.run(shutdown).await
}
