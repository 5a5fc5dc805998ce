//! Concurrent slot store with change notification.
//!
//! Slots live in a `DashMap` keyed by primary key, each shard holding the
//! per-parameter slots for that key. Every state change bumps a version
//! counter on a `watch` channel so waiters wake up instead of polling.
//!
//! Slot lifecycle for one fingerprint:
//! - absent -> Pending (`lookup` claims it; the caller must dispatch)
//! - Pending -> Resolved (`write` from the receive loop)
//! - Resolved -> Resolved (`write` again; last write wins)
//! - Pending -> Abandoned (connection closed or deadline expired)
//! - Abandoned / Resolved(Unmatched) -> Pending (`lookup` re-claims it)

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use tokio::sync::watch;

use super::{Fingerprint, Resolution};

/// Why a pending slot was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    ConnectionClosed,
    TimedOut,
    /// The request frame could not be built or sent.
    DispatchFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheSlot {
    Pending,
    Resolved(Resolution),
    Abandoned(AbandonReason),
}

/// Outcome of [`CacheStore::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The slot was absent and is now pending; the caller owns dispatching it.
    Claimed,
    /// Another caller already dispatched this request.
    InFlight,
    /// The result is already known.
    Cached(Resolution),
}

pub struct CacheStore {
    slots: DashMap<String, HashMap<String, CacheSlot>>,
    version: watch::Sender<u64>,
}

impl CacheStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            slots: DashMap::new(),
            version,
        }
    }

    /// Check the slot for `fingerprint`, atomically claiming it if absent.
    ///
    /// At most one caller ever observes [`Lookup::Claimed`] for a slot until
    /// it resolves or is abandoned.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        let mut shard = self
            .slots
            .entry(fingerprint.primary_key().to_string())
            .or_default();
        match shard.get(fingerprint.param_key()) {
            Some(CacheSlot::Pending) => return Lookup::InFlight,
            Some(CacheSlot::Resolved(resolution))
                if !matches!(resolution, Resolution::Unmatched(_)) =>
            {
                return Lookup::Cached(resolution.clone());
            }
            _ => {}
        }
        shard.insert(fingerprint.param_key().to_string(), CacheSlot::Pending);
        Lookup::Claimed
    }

    /// Current slot state, if any.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheSlot> {
        self.slots
            .get(fingerprint.primary_key())
            .and_then(|shard| shard.get(fingerprint.param_key()).cloned())
    }

    /// Store a resolution, replacing whatever the slot held.
    pub fn write(&self, fingerprint: &Fingerprint, resolution: Resolution) {
        self.slots
            .entry(fingerprint.primary_key().to_string())
            .or_default()
            .insert(
                fingerprint.param_key().to_string(),
                CacheSlot::Resolved(resolution),
            );
        self.notify();
    }

    /// Give up the listed slots that are still pending.
    ///
    /// Resolved slots are left alone. Returns how many slots changed.
    pub fn abandon<'a>(
        &self,
        fingerprints: impl IntoIterator<Item = &'a Fingerprint>,
        reason: AbandonReason,
    ) -> usize {
        let mut changed = 0;
        for fingerprint in fingerprints {
            if let Some(mut shard) = self.slots.get_mut(fingerprint.primary_key())
                && let Some(slot) = shard.get_mut(fingerprint.param_key())
                && *slot == CacheSlot::Pending
            {
                *slot = CacheSlot::Abandoned(reason);
                changed += 1;
            }
        }
        if changed > 0 {
            self.notify();
        }
        changed
    }

    /// Give up every pending slot.
    pub fn abandon_all_pending(&self, reason: AbandonReason) -> usize {
        let mut changed = 0;
        for mut shard in self.slots.iter_mut() {
            for slot in shard.values_mut() {
                if *slot == CacheSlot::Pending {
                    *slot = CacheSlot::Abandoned(reason);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.notify();
        }
        changed
    }

    /// Give up every pending slot not in `keep`.
    ///
    /// Used when reconnecting: slots owned by batch jobs that will be resent
    /// stay pending, everything else in flight on the old socket is lost.
    pub fn abandon_untracked(&self, keep: &HashSet<Fingerprint>, reason: AbandonReason) -> usize {
        let mut changed = 0;
        for mut shard in self.slots.iter_mut() {
            let (primary, slots) = shard.pair_mut();
            for (param, slot) in slots.iter_mut() {
                if *slot == CacheSlot::Pending
                    && !keep.contains(&Fingerprint::new(primary.as_str(), param.as_str()))
                {
                    *slot = CacheSlot::Abandoned(reason);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.notify();
        }
        changed
    }

    /// Discard every slot.
    pub fn clear(&self) {
        self.slots.clear();
        self.notify();
    }

    /// Receiver that observes a new version after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .map(|shard| {
                shard
                    .values()
                    .filter(|slot| **slot == CacheSlot::Pending)
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
