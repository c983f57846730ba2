//! A bounded reassembly table for receive-side multi-frame streams.
//!
//! PSACP tracks one in-flight stream per (sender, topic); BWACP tracks one
//! per (sender, target). Both use this same fixed-capacity table rather than
//! a heap-allocated map, so a slow or malicious peer can open at most
//! [`CAPACITY`] concurrent streams before new ones are rejected with
//! [`Error::TooManyStreams`].

use crate::error::Error;

/// Number of concurrent reassembly streams a single context tracks per
/// protocol layer. A compile-time constant, not runtime-tunable, matching
/// §9's "bound the outstanding reassembly table at compile time (e.g., 4
/// slots)".
pub const CAPACITY: usize = 4;

/// A fixed-capacity `key -> state` table with at most [`CAPACITY`] entries.
pub struct ReassemblyTable<K, V> {
    slots: [Option<(K, V)>; CAPACITY],
}

impl<K: Copy + PartialEq, V> ReassemblyTable<K, V> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [const { None }; CAPACITY],
        }
    }

    /// Look up the state for `key`, if a stream for it is currently tracked.
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.iter_mut().find_map(|slot| match slot {
            Some((k, v)) if *k == key => Some(v),
            _ => None,
        })
    }

    /// Start (or restart) the stream tracked under `key`, overwriting
    /// whatever was there. Used when a fresh "first frame of a stream"
    /// (PSACP `PUB`, BWACP `READY` with `interrupt = 1`) arrives and
    /// supersedes any in-flight reassembly for the same key.
    ///
    /// Fails with [`Error::TooManyStreams`] only when `key` is new and every
    /// slot is occupied by a *different* stream.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some((k, _)) if *k == key))
        {
            self.slots[idx] = Some((key, value));
            return Ok(());
        }
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyStreams)?;
        self.slots[idx] = Some((key, value));
        Ok(())
    }

    /// Drop the stream tracked under `key`, if any (e.g. once reassembly
    /// completes or an interrupt restarts it).
    pub fn remove(&mut self, key: K) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Some((k, _)) if *k == key))
        {
            *slot = None;
        }
    }

    /// Number of streams currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no streams are currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Copy + PartialEq, V> Default for ReassemblyTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
