//! Daemon - in-process scheduler for periodic reconciliation
//!
//! Runs the reconciler on a fixed interval in the foreground. Ctrl+C cancels
//! the shared token: an in-flight run stops between projects and the loop exits.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::sync::{ReconcileError, SyncReconciler, SyncSummary};

/// Counters kept across scheduled runs
#[derive(Debug, Clone, Default)]
pub struct DaemonStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_summary: Option<SyncSummary>,
    pub last_error: Option<String>,
}

pub struct Daemon {
    reconciler: SyncReconciler,
    interval: Duration,
    run_on_start: bool,
    shutdown: CancellationToken,
    stats: DaemonStats,
}

impl Daemon {
    pub fn new(reconciler: SyncReconciler, config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let interval = config
            .daemon_interval()
            .context("Failed to parse daemon sync interval")?;

        Ok(Self {
            reconciler,
            interval,
            run_on_start: config.daemon.run_on_start,
            shutdown,
            stats: DaemonStats::default(),
        })
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Run in the foreground until Ctrl+C
    pub async fn run(&mut self) -> Result<DaemonStats> {
        info!("Starting portfolio-sync daemon");

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            shutdown.cancel();
        });

        self.run_loop().await
    }

    /// Scheduling loop; returns once the shutdown token is cancelled
    pub async fn run_loop(&mut self) -> Result<DaemonStats> {
        let shutdown = self.shutdown.clone();
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Daemon loop started with interval: {:?}", self.interval);

        if !self.run_on_start {
            // the first tick completes immediately
            timer.tick().await;
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, leaving daemon loop");
                    break;
                }

                _ = timer.tick() => {
                    debug!("Starting scheduled sync");
                    self.run_once().await;
                }
            }
        }

        info!(
            "Daemon stopped after {} runs ({} failed)",
            self.stats.total_runs, self.stats.failed_runs
        );
        Ok(self.stats.clone())
    }

    /// One scheduled run; failures are logged and counted, never fatal
    pub async fn run_once(&mut self) {
        let started = Instant::now();
        self.stats.total_runs += 1;

        match self.reconciler.run_stored(&self.shutdown.child_token()).await {
            Ok(summary) => {
                self.stats.successful_runs += 1;
                self.stats.last_error = None;
                log_sync_success(&summary, started.elapsed());
                self.stats.last_summary = Some(summary);
            }
            Err(ReconcileError::AlreadyRunning) => {
                warn!("Previous sync still running, skipping this tick");
                self.stats.failed_runs += 1;
                self.stats.last_error = Some(ReconcileError::AlreadyRunning.to_string());
            }
            Err(e) => {
                error!("Scheduled sync failed: {}", e);
                self.stats.failed_runs += 1;
                self.stats.last_error = Some(e.to_string());
            }
        }
    }
}

fn log_sync_success(summary: &SyncSummary, duration: Duration) {
    if summary.errors.is_empty() {
        info!(
            "Scheduled sync finished in {:.2}s: {} synced, {} hidden",
            duration.as_secs_f64(),
            summary.synced,
            summary.hidden
        );
    } else {
        warn!(
            "Scheduled sync finished in {:.2}s with {} errors: {}",
            duration.as_secs_f64(),
            summary.errors.len(),
            summary.errors.join("; ")
        );
    }
}

async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        // without a signal handler the daemon can only be killed
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}
