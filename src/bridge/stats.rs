//! Bridge traffic statistics
//!
//! Lifetime counters for packets, bytes and drops, plus an interval
//! accumulator for the periodic throughput log. The interval counters keep
//! accumulating until either direction crosses the report threshold, so a
//! mostly idle bridge logs nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default interval between throughput checks
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Default minimum bytes in either direction before a report is logged
pub const DEFAULT_REPORT_THRESHOLD: u64 = 1024;

/// Reason a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a well-formed IPv4 packet
    Malformed,
    /// No next hop for the destination
    NoRoute,
    /// Source not allowed through this relay
    NotAdmitted,
    /// Transport or interface write failed
    SendFailed,
}

/// Atomic traffic counters for one bridge
#[derive(Debug)]
pub struct TrafficStats {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_no_route: AtomicU64,
    dropped_not_admitted: AtomicU64,
    send_failures: AtomicU64,
    interval_rx: AtomicU64,
    interval_tx: AtomicU64,
    interval_start: Mutex<Instant>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self {
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            dropped_no_route: AtomicU64::new(0),
            dropped_not_admitted: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            interval_rx: AtomicU64::new(0),
            interval_tx: AtomicU64::new(0),
            interval_start: Mutex::new(Instant::now()),
        }
    }
}

impl TrafficStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet received from the transport
    pub fn record_rx(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.interval_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a packet sent on the transport
    pub fn record_tx(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.interval_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a dropped packet
    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::NoRoute => &self.dropped_no_route,
            DropReason::NotAdmitted => &self.dropped_not_admitted,
            DropReason::SendFailed => &self.send_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes received
    #[must_use]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes sent
    #[must_use]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Packets dropped for `reason`
    #[must_use]
    pub fn dropped(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::Malformed => self.dropped_malformed.load(Ordering::Relaxed),
            DropReason::NoRoute => self.dropped_no_route.load(Ordering::Relaxed),
            DropReason::NotAdmitted => self.dropped_not_admitted.load(Ordering::Relaxed),
            DropReason::SendFailed => self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            rx_bytes: self.rx_bytes(),
            tx_bytes: self.tx_bytes(),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            dropped_malformed: self.dropped(DropReason::Malformed),
            dropped_no_route: self.dropped(DropReason::NoRoute),
            dropped_not_admitted: self.dropped(DropReason::NotAdmitted),
            send_failures: self.dropped(DropReason::SendFailed),
        }
    }

    /// Close the current interval if either direction reached `threshold`.
    ///
    /// Returns `None` and keeps accumulating otherwise.
    pub fn take_interval(&self, threshold: u64) -> Option<IntervalReport> {
        let rx = self.interval_rx.load(Ordering::Relaxed);
        let tx = self.interval_tx.load(Ordering::Relaxed);
        if rx < threshold && tx < threshold {
            return None;
        }

        let rx = self.interval_rx.swap(0, Ordering::Relaxed);
        let tx = self.interval_tx.swap(0, Ordering::Relaxed);
        let now = Instant::now();
        let elapsed = {
            let mut start = self.interval_start.lock();
            let elapsed = now.saturating_duration_since(*start);
            *start = now;
            elapsed
        };
        Some(IntervalReport {
            rx_bytes: rx,
            tx_bytes: tx,
            elapsed,
        })
    }
}

/// Snapshot of traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub dropped_malformed: u64,
    pub dropped_no_route: u64,
    pub dropped_not_admitted: u64,
    pub send_failures: u64,
}

/// Traffic accumulated over one report interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalReport {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub elapsed: Duration,
}

impl IntervalReport {
    /// Receive rate in bytes per second
    #[must_use]
    pub fn rx_rate(&self) -> u64 {
        rate(self.rx_bytes, self.elapsed)
    }

    /// Transmit rate in bytes per second
    #[must_use]
    pub fn tx_rate(&self) -> u64 {
        rate(self.tx_bytes, self.elapsed)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return bytes;
    }
    (bytes as f64 / secs) as u64
}

/// Format a byte count with binary units ("512 B", "1.5 KiB", "3.0 MiB")
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {prefix}iB", bytes as f64 / div as f64)
}

/// Log throughput every `interval` once either direction reaches `threshold`.
///
/// Runs until `cancel` fires.
pub async fn run_reporter(
    stats: Arc<TrafficStats>,
    interval: Duration,
    threshold: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(report) = stats.take_interval(threshold) {
                    info!(
                        "rx: {} ({}/s), tx: {} ({}/s), duration: {:.2}s",
                        format_bytes(report.rx_bytes),
                        format_bytes(report.rx_rate()),
                        format_bytes(report.tx_bytes),
                        format_bytes(report.tx_rate()),
                        report.elapsed.as_secs_f64()
                    );
                }
            }
        }
    }
}
