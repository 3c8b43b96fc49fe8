//! Fragment reassembly for BLE notifications.
//!
//! Some peripherals deliver a 46-byte payload in one notification, others split
//! it into a fixed sequence of fragments that carry no header at all. The only
//! way to tell fragments apart is their byte length, so the reassembler keeps
//! one slot per expected length and emits the concatenation once every slot is
//! filled.
//!
//! # Staleness
//!
//! A partial frame that sits longer than `stale_after` is discarded, either by
//! [`FragmentReassembler::sweep`] (driven by the link's timer) or lazily on the
//! next insert. This keeps fragments of two different bursts from being
//! stitched together.
//!
//! # Thread Safety
//!
//! Not thread-safe; owned by the connection task.

use crate::error::{ReassemblyError, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// Ordered fragment lengths that make up one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentLayout {
    lengths: Vec<usize>,
}

impl FragmentLayout {
    /// Fragments in wire order; lengths must be pairwise distinct.
    pub fn new(lengths: Vec<usize>) -> Self {
        Self { lengths }
    }

    /// Layout of a peripheral that sends the whole payload at once.
    pub fn single(len: usize) -> Self {
        Self { lengths: vec![len] }
    }

    pub fn total_len(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn fragment_count(&self) -> usize {
        self.lengths.len()
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    fn slot_of(&self, len: usize) -> Option<usize> {
        self.lengths.iter().position(|&l| l == len)
    }

    /// Cut a payload along the layout.
    pub fn split<'a>(&self, payload: &'a [u8]) -> Vec<&'a [u8]> {
        let mut rest = payload;
        let mut parts = Vec::with_capacity(self.lengths.len());
        for &len in &self.lengths {
            let (head, tail) = rest.split_at(len.min(rest.len()));
            parts.push(head);
            rest = tail;
        }
        parts
    }
}

/// Reassembler for one link.
#[derive(Debug)]
pub struct FragmentReassembler {
    layout: FragmentLayout,
    stale_after: Duration,
    slots: Vec<Option<Vec<u8>>>,
    first_seen: Option<Instant>,
}

impl FragmentReassembler {
    pub fn new(layout: FragmentLayout, stale_after: Duration) -> Self {
        let slots = vec![None; layout.fragment_count()];
        Self {
            layout,
            stale_after,
            slots,
            first_seen: None,
        }
    }

    pub fn layout(&self) -> &FragmentLayout {
        &self.layout
    }

    /// Buffer one notification.
    ///
    /// # Returns
    /// - `Ok(Some(payload))` once the last missing fragment arrived
    /// - `Ok(None)` while fragments are still missing
    ///
    /// # Errors
    /// - `ReassemblyError::UnrecognizedLength` for a length outside the layout
    /// - `ReassemblyError::Restarted` when a slot was already filled; the old
    ///   partial frame is dropped and this fragment starts a new one
    pub fn insert(&mut self, fragment: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        if fragment.len() == self.layout.total_len() && self.layout.fragment_count() > 1 {
            if !self.is_idle() {
                debug!(missing = self.missing_count(), "whole payload replaced a partial frame");
                self.clear();
            }
            return Ok(Some(fragment.to_vec()));
        }

        let slot = self
            .layout
            .slot_of(fragment.len())
            .ok_or(ReassemblyError::UnrecognizedLength { len: fragment.len() })?;

        if let Some(error) = self.sweep(now) {
            debug!(%error, "dropped stale partial frame before insert");
        }

        let restarted = self.slots[slot].is_some();
        if restarted {
            self.clear();
        }

        self.slots[slot] = Some(fragment.to_vec());
        self.first_seen.get_or_insert(now);

        if restarted {
            return Err(ReassemblyError::Restarted { len: fragment.len() }.into());
        }

        if self.slots.iter().all(Option::is_some) {
            let payload = self.slots.iter_mut().filter_map(Option::take).flatten().collect();
            self.first_seen = None;
            return Ok(Some(payload));
        }

        Ok(None)
    }

    /// Discard the partial frame if it is older than the stale timeout.
    pub fn sweep(&mut self, now: Instant) -> Option<ReassemblyError> {
        let first_seen = self.first_seen?;
        let age = now.saturating_duration_since(first_seen);
        if age < self.stale_after {
            return None;
        }

        let missing = self.missing_count();
        self.clear();
        Some(ReassemblyError::Stale {
            age_ms: age.as_millis() as u64,
            missing,
        })
    }

    /// Drop any partial frame, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.first_seen = None;
    }

    pub fn missing_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.first_seen.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> FragmentReassembler {
        FragmentReassembler::new(FragmentLayout::new(vec![20, 18, 8]), Duration::from_millis(500))
    }

    fn payload() -> Vec<u8> {
        (0..46).collect()
    }

    #[test]
    fn test_in_order_fragments() {
        let mut r = reassembler();
        let now = Instant::now();
        let payload = payload();
        let parts = r.layout().split(&payload);

        assert!(r.insert(parts[0], now).unwrap().is_none());
        assert!(r.insert(parts[1], now).unwrap().is_none());
        assert_eq!(r.insert(parts[2], now).unwrap(), Some(payload));
        assert!(r.is_idle());
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut r = reassembler();
        let now = Instant::now();
        let payload = payload();
        let parts = r.layout().split(&payload);

        assert!(r.insert(parts[2], now).unwrap().is_none());
        assert!(r.insert(parts[0], now).unwrap().is_none());
        assert_eq!(r.insert(parts[1], now).unwrap(), Some(payload));
    }

    #[test]
    fn test_unrecognized_length() {
        let mut r = reassembler();
        assert!(matches!(
            r.insert(&[0; 7], Instant::now()),
            Err(crate::error::Error::Reassembly(ReassemblyError::UnrecognizedLength { len: 7 }))
        ));
        assert!(r.is_idle());
    }

    #[test]
    fn test_repeated_slot_restarts_frame() {
        let mut r = reassembler();
        let now = Instant::now();
        r.insert(&[1; 20], now).unwrap();
        r.insert(&[2; 18], now).unwrap();

        let result = r.insert(&[3; 20], now);
        assert!(matches!(
            result,
            Err(crate::error::Error::Reassembly(ReassemblyError::Restarted { len: 20 }))
        ));
        // only the new fragment survived
        assert_eq!(r.missing_count(), 2);

        r.insert(&[4; 18], now).unwrap();
        let frame = r.insert(&[5; 8], now).unwrap().unwrap();
        assert_eq!(&frame[..20], &[3; 20]);
        assert_eq!(&frame[20..38], &[4; 18]);
    }

    #[test]
    fn test_sweep_discards_stale_partial() {
        let mut r = reassembler();
        let start = Instant::now();
        r.insert(&[1; 20], start).unwrap();

        assert!(r.sweep(start + Duration::from_millis(100)).is_none());

        match r.sweep(start + Duration::from_millis(600)) {
            Some(ReassemblyError::Stale { missing, age_ms }) => {
                assert_eq!(missing, 2);
                assert_eq!(age_ms, 600);
            }
            other => panic!("expected stale partial frame, got {other:?}"),
        }
        assert!(r.is_idle());
    }

    #[test]
    fn test_bursts_are_not_stitched() {
        let mut r = reassembler();
        let start = Instant::now();
        r.insert(&[1; 20], start).unwrap();
        r.insert(&[1; 18], start).unwrap();

        // next burst arrives long after; its first fragments must not complete the old frame
        let later = start + Duration::from_secs(5);
        assert!(r.insert(&[2; 8], later).unwrap().is_none());
        assert_eq!(r.missing_count(), 2);
    }

    #[test]
    fn test_whole_payload_passes_through() {
        let mut r = reassembler();
        let now = Instant::now();
        r.insert(&[1; 20], now).unwrap();
        assert_eq!(r.insert(&payload(), now).unwrap(), Some(payload()));
        assert!(r.is_idle());

        let mut single = FragmentReassembler::new(FragmentLayout::single(46), Duration::from_millis(500));
        assert_eq!(single.insert(&payload(), now).unwrap(), Some(payload()));
    }
}
