//! Per-entity holding area for events whose identity is not yet known.
//!
//! Each key owns one slot behind its own async mutex. The journal reader
//! pushes into a slot; the resolution callback drains it, marks it closed and
//! retires it from the map while still holding the slot lock. A producer that
//! wakes up on a closed slot looks the key up again and gets a fresh one, so
//! no event can land in a slot nobody will drain.

use crate::core::{EntityKey, Result, Usn, VolumeId};
use crate::journal::ChangeEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Default)]
pub struct PendingSlot {
    events: Vec<ChangeEvent>,
    closed: bool,
}

impl PendingSlot {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Remove the first `count` events once they have been written.
    pub fn consume(&mut self, count: usize) {
        self.events.drain(..count.min(self.events.len()));
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

pub type SlotHandle = Arc<AsyncMutex<PendingSlot>>;

struct SlotEntry {
    slot: SlotHandle,
    oldest: Option<Usn>,
}

pub enum PushOutcome {
    Buffered,
    /// A re-read of an event the slot already holds; nothing was added.
    AlreadyHeld,
    /// The slot is full; the caller must write the event some other way.
    Overflow(ChangeEvent),
}

pub struct PendingBuffers {
    capacity: usize,
    slots: Mutex<HashMap<EntityKey, SlotEntry>>,
}

impl PendingBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Slot for `key`, created empty when absent.
    pub fn slot(&self, key: &EntityKey) -> Result<SlotHandle> {
        let mut slots = self.slots.lock()?;
        let entry = slots.entry(key.clone()).or_insert_with(|| SlotEntry {
            slot: Arc::new(AsyncMutex::new(PendingSlot::default())),
            oldest: None,
        });
        Ok(Arc::clone(&entry.slot))
    }

    pub fn existing(&self, key: &EntityKey) -> Result<Option<SlotHandle>> {
        Ok(self.slots.lock()?.get(key).map(|entry| Arc::clone(&entry.slot)))
    }

    pub fn contains(&self, key: &EntityKey) -> Result<bool> {
        Ok(self.slots.lock()?.contains_key(key))
    }

    /// Append to a locked, open slot.
    /// Events arrive in usn order, so anything at or below the newest held
    /// usn is a replay.
    pub fn push(&self, key: &EntityKey, slot: &mut PendingSlot, event: ChangeEvent) -> Result<PushOutcome> {
        if slot.events.last().is_some_and(|held| held.usn >= event.usn) {
            return Ok(PushOutcome::AlreadyHeld);
        }
        if slot.events.len() >= self.capacity {
            return Ok(PushOutcome::Overflow(event));
        }
        let usn = event.usn;
        slot.events.push(event);
        if let Some(entry) = self.slots.lock()?.get_mut(key) {
            if entry.oldest.is_none_or(|oldest| usn < oldest) {
                entry.oldest = Some(usn);
            }
        }
        Ok(PushOutcome::Buffered)
    }

    /// Recompute the oldest held usn after a partial drain.
    pub fn refresh_oldest(&self, key: &EntityKey, slot: &PendingSlot) -> Result<()> {
        if let Some(entry) = self.slots.lock()?.get_mut(key) {
            entry.oldest = slot.events.iter().map(|e| e.usn).min();
        }
        Ok(())
    }

    /// Drop `handle` from the map. Call with the slot lock held and the slot closed.
    pub fn retire(&self, key: &EntityKey, handle: &SlotHandle) -> Result<()> {
        let mut slots = self.slots.lock()?;
        if slots
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, handle))
        {
            slots.remove(key);
        }
        Ok(())
    }

    /// Oldest usn still held for a volume.
    pub fn oldest_usn(&self, volume: &VolumeId) -> Result<Option<Usn>> {
        let slots = self.slots.lock()?;
        Ok(slots
            .iter()
            .filter(|(key, _)| &key.volume == volume)
            .filter_map(|(_, entry)| entry.oldest)
            .min())
    }

    /// Keys of `volume` that currently have a slot.
    pub fn keys_for(&self, volume: &VolumeId) -> Result<Vec<EntityKey>> {
        Ok(self
            .slots
            .lock()?
            .keys()
            .filter(|key| &key.volume == volume)
            .cloned()
            .collect())
    }

    /// Number of keys currently holding events.
    pub fn held_keys(&self) -> Result<usize> {
        Ok(self
            .slots
            .lock()?
            .values()
            .filter(|entry| entry.oldest.is_some())
            .count())
    }
}
