//! Typed document events and the id-keyed subscription registry.
//!
//! Subscribers register a `(target element, kind mask)` pair and get back a
//! [`SlotId`]; deliveries accumulate in a queue the host drains after each
//! batch of edits. Unsubscription is O(1) by slot id. There are no string
//! channels and no closure-keyed maps.

use std::collections::HashMap;

use slab::Slab;
use smallvec::SmallVec;

use crate::ElementId;

/// Identifier of a subscription slot in the registry.
pub type SlotId = usize;

/// The kinds of change a document element can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A property key was newly defined in a dict, or elements were inserted
    /// into a collection.
    Add,
    /// A property key was retracted, or elements were removed.
    Delete,
    /// An existing value changed.
    Update,
    /// The shape of a collection changed (insert/remove/reset).
    StructuralChange,
    /// A rule was re-targeted at a new selector list.
    SelectorChange,
}

impl EventKind {
    pub const fn mask(self) -> u8 {
        match self {
            EventKind::Add => 1 << 0,
            EventKind::Delete => 1 << 1,
            EventKind::Update => 1 << 2,
            EventKind::StructuralChange => 1 << 3,
            EventKind::SelectorChange => 1 << 4,
        }
    }
}

/// Mask matching every event kind.
pub const ALL_EVENTS: u8 = EventKind::Add.mask()
    | EventKind::Delete.mask()
    | EventKind::Update.mask()
    | EventKind::StructuralChange.mask()
    | EventKind::SelectorChange.mask();

/// A change notification.
#[derive(Debug, Clone)]
pub struct DocEvent {
    pub kind: EventKind,
    /// Element where the change actually happened (events forward upward,
    /// so this can differ from the subscribed target).
    pub origin: ElementId,
    /// Property keys affected, for dict-level events.
    pub keys: SmallVec<[String; 2]>,
    /// Elements affected, for structural events.
    pub elements: SmallVec<[ElementId; 2]>,
}

impl DocEvent {
    pub(crate) fn structural(kind: EventKind, origin: ElementId) -> Self {
        Self {
            kind,
            origin,
            keys: SmallVec::new(),
            elements: SmallVec::new(),
        }
    }

    pub(crate) fn keyed(kind: EventKind, origin: ElementId, key: &str) -> Self {
        let mut keys = SmallVec::new();
        keys.push(key.to_string());
        Self {
            kind,
            origin,
            keys,
            elements: SmallVec::new(),
        }
    }
}

/// One queued event delivery to one subscription slot.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub slot: SlotId,
    /// The element the slot was subscribed to.
    pub target: ElementId,
    pub event: DocEvent,
}

struct SlotEntry {
    target: ElementId,
    mask: u8,
}

/// Subscription table plus the pending delivery queue.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Slab<SlotEntry>,
    by_target: HashMap<ElementId, Vec<SlotId>>,
    queue: Vec<Delivery>,
}

impl Registry {
    pub(crate) fn subscribe(&mut self, target: ElementId, mask: u8) -> SlotId {
        let slot = self.slots.insert(SlotEntry { target, mask });
        self.by_target.entry(target).or_default().push(slot);
        slot
    }

    /// Remove a subscription. Unsubscribing a slot that was never subscribed
    /// (or already removed) is an invariant violation.
    pub(crate) fn unsubscribe(&mut self, slot: SlotId) {
        assert!(
            self.slots.contains(slot),
            "unsubscribe of slot {slot} which has no subscription"
        );
        let entry = self.slots.remove(slot);
        if let Some(slots) = self.by_target.get_mut(&entry.target) {
            slots.retain(|&s| s != slot);
        }
    }

    /// Stop delivering to subscribers of a destroyed element. Slot ids stay
    /// allocated so a later explicit unsubscribe remains valid.
    pub(crate) fn retire_target(&mut self, target: ElementId) {
        self.by_target.remove(&target);
    }

    pub(crate) fn emit(&mut self, target: ElementId, event: &DocEvent) {
        let Some(slots) = self.by_target.get(&target) else {
            return;
        };
        for &slot in slots {
            if self.slots[slot].mask & event.kind.mask() != 0 {
                self.queue.push(Delivery {
                    slot,
                    target,
                    event: event.clone(),
                });
            }
        }
    }

    pub(crate) fn take(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_delivery_and_unsubscribe() {
        let mut reg = Registry::default();
        let target = ElementId(7);
        let slot = reg.subscribe(target, EventKind::Update.mask());

        reg.emit(target, &DocEvent::keyed(EventKind::Add, target, "a"));
        assert!(reg.take().is_empty());

        reg.emit(target, &DocEvent::keyed(EventKind::Update, target, "a"));
        let deliveries = reg.take();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].slot, slot);
        assert_eq!(deliveries[0].event.keys[0], "a");

        reg.unsubscribe(slot);
        reg.emit(target, &DocEvent::keyed(EventKind::Update, target, "a"));
        assert!(reg.take().is_empty());
    }

    #[test]
    #[should_panic(expected = "no subscription")]
    fn double_unsubscribe_panics() {
        let mut reg = Registry::default();
        let slot = reg.subscribe(ElementId(1), ALL_EVENTS);
        reg.unsubscribe(slot);
        reg.unsubscribe(slot);
    }
}
