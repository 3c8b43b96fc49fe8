//! Counters describing how a link behaved.
//!
//! Most of what goes wrong on a BLE link is expected noise: fragments lost,
//! frames failing CRC, readings flagged by the sensor. None of it reaches the
//! user, so these counters are the only way to see it.
//!
//! # Thread Safety
//!
//! `LinkMetrics` is NOT thread-safe. It is owned by the connection task and
//! handed back as a snapshot when the link shuts down.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LinkMetrics {
    // === Timing ===
    pub start_time: Instant,
    pub end_time: Option<Instant>,

    // === Radio ===
    /// Notifications delivered by the central
    pub fragments_received: u64,
    /// Fragments thrown away (unknown length, restarted or stale partial frames)
    pub fragments_discarded: u64,
    /// Connection attempts beyond the first
    pub reconnect_attempts: u64,
    /// Unexpected disconnects
    pub disconnects: u64,
    /// Scans, writes and subscriptions the radio refused
    pub radio_failures: u64,

    // === Frames ===
    pub frames_reassembled: u64,
    pub frames_decoded: u64,
    pub frames_failed_crc: u64,
    /// Frames older than one already accepted
    pub frames_out_of_order: u64,

    // === Readings ===
    pub readings_emitted: u64,
    /// Readings missing from decoded frames because the sensor flagged them
    pub readings_dropped: u64,
    /// Batches held back by the sampling interval
    pub batches_skipped: u64,

    // === Relay ===
    pub relay_polls: u64,
    pub relay_failures: u64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            fragments_received: 0,
            fragments_discarded: 0,
            reconnect_attempts: 0,
            disconnects: 0,
            radio_failures: 0,
            frames_reassembled: 0,
            frames_decoded: 0,
            frames_failed_crc: 0,
            frames_out_of_order: 0,
            readings_emitted: 0,
            readings_dropped: 0,
            batches_skipped: 0,
            relay_polls: 0,
            relay_failures: 0,
        }
    }

    pub fn complete(&mut self) {
        self.end_time = Some(Instant::now());
    }

    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Share of reassembled frames rejected by the CRC check.
    pub fn crc_failure_rate(&self) -> f64 {
        if self.frames_reassembled == 0 {
            0.0
        } else {
            self.frames_failed_crc as f64 / self.frames_reassembled as f64
        }
    }

    /// Share of received fragments that never became part of a frame.
    pub fn fragment_loss_rate(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            self.fragments_discarded as f64 / self.fragments_received as f64
        }
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n=== Link Summary ===");
        println!("Duration: {} ms", self.duration().as_millis());
        println!();

        println!("=== Radio ===");
        println!("Fragments received: {}", self.fragments_received);
        println!(
            "Fragments discarded: {} ({:.2}%)",
            self.fragments_discarded,
            self.fragment_loss_rate() * 100.0
        );
        println!("Disconnects: {}", self.disconnects);
        println!("Radio failures: {}", self.radio_failures);
        println!("Reconnect attempts: {}", self.reconnect_attempts);
        println!();

        println!("=== Frames ===");
        println!("Reassembled: {}", self.frames_reassembled);
        println!("Decoded: {}", self.frames_decoded);
        println!(
            "CRC failures: {} ({:.2}%)",
            self.frames_failed_crc,
            self.crc_failure_rate() * 100.0
        );
        println!("Out of order: {}", self.frames_out_of_order);
        println!();

        println!("=== Readings ===");
        println!("Emitted: {}", self.readings_emitted);
        println!("Dropped (flagged): {}", self.readings_dropped);
        println!("Batches skipped: {}", self.batches_skipped);

        if self.relay_polls > 0 || self.relay_failures > 0 {
            println!();
            println!("=== Relay ===");
            println!("Polls: {}", self.relay_polls);
            println!("Failures: {}", self.relay_failures);
        }
        println!();
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = LinkMetrics::new();
        assert!(metrics.end_time.is_none());
        assert!(metrics.duration().as_millis() < 100);
    }

    #[test]
    fn test_rates() {
        let mut metrics = LinkMetrics::new();
        assert_eq!(metrics.crc_failure_rate(), 0.0);

        metrics.frames_reassembled = 20;
        metrics.frames_failed_crc = 5;
        assert_eq!(metrics.crc_failure_rate(), 0.25);

        metrics.fragments_received = 100;
        metrics.fragments_discarded = 3;
        assert_eq!(metrics.fragment_loss_rate(), 0.03);
    }
}
