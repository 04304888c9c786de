//! [`SpeedTestEngine`] backed by the public speed.cloudflare.com endpoints.
//!
//! Operations run in plan order. Latency probes are zero-byte downloads;
//! while a transfer is in flight a second probe loop measures loaded
//! latency for that direction.

use crate::cloudflare::client::{Client, Timing};
use crate::cloudflare::requests::{Download, Upload};
use crate::engine::{
    BandwidthSample, EngineReport, ProgressCallback, ProgressEvent,
    SpeedTestEngine, TestPhase,
};
use crate::errors::{ErrorKind, MonitorError};
use crate::plan::{Direction, MeasurementPlan, Operation, TransferSpec};
use crate::resilience::Reachability;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Give up on the reachability probe after this long.
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum gap between loaded latency probes.
const LOADED_PROBE_INTERVAL: Duration = Duration::from_millis(400);

/// Loaded probes only count when the transfer they overlapped lasted at
/// least this long.
const LOADED_MIN_TRANSFER_MS: f64 = 250.0;

pub struct CloudflareEngine {
    client: Client,
    aborted: AtomicBool,
}

impl CloudflareEngine {
    pub fn new(client: Client) -> Self {
        Self { client, aborted: AtomicBool::new(false) }
    }

    fn check_aborted(&self) -> Result<(), MonitorError> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(MonitorError::aborted("Speed test aborted"))
        } else {
            Ok(())
        }
    }

    async fn probe(&self) -> Result<f64, MonitorError> {
        let timing = self.client.send(&Download { bytes: 0 }).await?;
        Ok(timing.latency_ms())
    }

    async fn run_latency(
        &self,
        num_packets: u32,
        progress: &dyn ProgressCallback,
        latencies: &mut Vec<f64>,
    ) -> Result<(), MonitorError> {
        let total = num_packets as usize;
        for i in 0..total {
            self.check_aborted()?;
            match self.probe().await {
                Ok(value_ms) => {
                    latencies.push(value_ms);
                    progress.on_progress(ProgressEvent::LatencyMeasurement {
                        value_ms,
                        current: i + 1,
                        total,
                    });
                }
                Err(e) => {
                    warn!("Latency measurement {}/{} failed: {}", i + 1, total, e);
                    progress.on_progress(ProgressEvent::Error(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn transfer(
        &self,
        direction: Direction,
        bytes: u64,
    ) -> Result<Timing, MonitorError> {
        match direction {
            Direction::Download => self.client.send(&Download { bytes }).await,
            Direction::Upload => self.client.send(&Upload { bytes }).await,
        }
    }

    /// Runs one transfer alongside a loaded latency probe loop.
    async fn transfer_under_load(
        &self,
        direction: Direction,
        bytes: u64,
    ) -> (Result<Timing, MonitorError>, Vec<f64>) {
        let finished = AtomicBool::new(false);

        let transfer = async {
            let result = self.transfer(direction, bytes).await;
            finished.store(true, Ordering::SeqCst);
            result
        };

        let probes = async {
            let mut samples = Vec::new();
            loop {
                sleep(LOADED_PROBE_INTERVAL).await;
                if finished.load(Ordering::SeqCst)
                    || self.aborted.load(Ordering::SeqCst)
                {
                    break;
                }
                let begin = Instant::now();
                if let Ok(ms) = self.probe().await {
                    if !finished.load(Ordering::SeqCst) {
                        samples.push(ms);
                    }
                }
                debug!("Loaded probe took {:?}", begin.elapsed());
            }
            samples
        };

        tokio::join!(transfer, probes)
    }

    async fn run_transfers(
        &self,
        direction: Direction,
        spec: &TransferSpec,
        progress: &dyn ProgressCallback,
        samples: &mut Vec<BandwidthSample>,
        loaded: &mut Vec<f64>,
    ) -> Result<(), MonitorError> {
        let total = spec.count as usize;
        let mut last_error = None;

        for i in 0..total {
            self.check_aborted()?;

            let (result, probes) =
                self.transfer_under_load(direction, spec.bytes).await;

            let timing = match result {
                Ok(timing) => timing,
                Err(e) => {
                    warn!(
                        "{:?} {}B {}/{} failed: {}",
                        direction, spec.bytes, i + 1, total, e
                    );
                    progress.on_progress(ProgressEvent::Error(e.to_string()));
                    last_error = Some(e);
                    continue;
                }
            };

            let duration_ms = match direction {
                Direction::Download => timing.download_ms(),
                Direction::Upload => timing.upload_ms(),
            };
            if duration_ms >= LOADED_MIN_TRANSFER_MS {
                loaded.extend(probes);
            }

            let sample = BandwidthSample {
                direction,
                bytes: spec.bytes,
                duration_ms,
                bypass_min_duration: spec.bypass_min_duration,
            };
            progress.on_progress(ProgressEvent::BandwidthMeasurement {
                direction,
                speed_mbps: sample.speed_mbps(),
                bytes: spec.bytes,
                current: i + 1,
                total,
            });
            samples.push(sample);
        }

        // A batch where nothing got through means the link is down, not slow.
        match last_error {
            Some(e) if samples.iter().all(|s| s.direction != direction) => Err(e),
            _ => Ok(()),
        }
    }
}

impl SpeedTestEngine for CloudflareEngine {
    async fn run(
        &self,
        plan: &MeasurementPlan,
        progress: &dyn ProgressCallback,
    ) -> Result<EngineReport, MonitorError> {
        self.aborted.store(false, Ordering::SeqCst);
        info!("Starting speed test ({} operations)", plan.len());

        let mut latency = Vec::new();
        let mut bandwidth = Vec::new();
        let mut loaded_down = Vec::new();
        let mut loaded_up = Vec::new();
        let mut phase = None;

        for operation in plan.operations() {
            let current = match operation {
                Operation::Latency { .. } => TestPhase::Latency,
                Operation::Download(_) => TestPhase::Download,
                Operation::Upload(_) => TestPhase::Upload,
            };
            if phase != Some(current) {
                phase = Some(current);
                progress.on_progress(ProgressEvent::PhaseChange(current));
            }

            match operation {
                Operation::Latency { num_packets } => {
                    self.run_latency(*num_packets, progress, &mut latency).await?
                }
                Operation::Download(spec) => {
                    self.run_transfers(
                        Direction::Download,
                        spec,
                        progress,
                        &mut bandwidth,
                        &mut loaded_down,
                    )
                    .await?
                }
                Operation::Upload(spec) => {
                    self.run_transfers(
                        Direction::Upload,
                        spec,
                        progress,
                        &mut bandwidth,
                        &mut loaded_up,
                    )
                    .await?
                }
            }
        }

        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Complete));

        if latency.is_empty() && bandwidth.is_empty() {
            return Err(MonitorError::new(
                ErrorKind::Engine,
                "No measurements completed",
            ));
        }

        let report =
            EngineReport::from_samples(bandwidth, latency, loaded_down, loaded_up);
        info!(
            "Speed test complete: download={:?} bps, upload={:?} bps",
            report.summary.download_bandwidth, report.summary.upload_bandwidth
        );
        Ok(report)
    }

    fn abort(&self) {
        debug!("Abort requested");
        self.aborted.store(true, Ordering::SeqCst);
    }

    async fn reachability(&self) -> Reachability {
        let begin = Instant::now();
        match timeout(REACHABILITY_TIMEOUT, self.client.trace()).await {
            Ok(Ok(trace)) => {
                let elapsed = begin.elapsed().as_millis() as u64;
                debug!(
                    "Reachable via {} ({}) in {} ms",
                    trace.colo, trace.loc, elapsed
                );
                Reachability::online(elapsed)
            }
            Ok(Err(e)) => {
                debug!("Reachability probe failed: {}", e);
                Reachability::offline()
            }
            Err(_) => Reachability::timed_out(REACHABILITY_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LogProgress;

    #[tokio::test]
    async fn test_aborted_engine_refuses_work() {
        let engine = CloudflareEngine::new(Client::new().unwrap());
        engine.abort();
        assert!(engine.check_aborted().is_err());

        let mut latencies = Vec::new();
        let error = engine
            .run_latency(3, &LogProgress, &mut latencies)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Aborted);
        assert!(latencies.is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_reports_no_measurements() {
        let engine = CloudflareEngine::new(Client::new().unwrap());
        let error = engine
            .run(&MeasurementPlan::from(vec![]), &LogProgress)
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Engine);
    }
}
