//! Storage for the tranlocals of one transaction

use crate::tranlocal::AnyTranlocal;
use rustc_hash::FxHashMap;
use std::collections::hash_map;
use std::{option, slice};
use tranquil_core::RefId;

pub(crate) type Slot = Box<dyn AnyTranlocal>;

/// How a transaction stores the references it opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStrategy {
    /// A single slot
    Mono,
    /// Linear array of the given capacity
    FixedLength(usize),
    /// Hash-indexed, unbounded
    Variable,
}

impl AttachmentStrategy {
    /// Maximum number of references, `None` if unbounded
    pub fn capacity(self) -> Option<usize> {
        match self {
            AttachmentStrategy::Mono => Some(1),
            AttachmentStrategy::FixedLength(capacity) => Some(capacity),
            AttachmentStrategy::Variable => None,
        }
    }
}

pub(crate) enum Attachments {
    Mono(Option<Slot>),
    FixedLength { slots: Vec<Slot>, capacity: usize },
    Variable(FxHashMap<RefId, Slot>),
}

impl Attachments {
    pub(crate) fn new(strategy: AttachmentStrategy) -> Self {
        match strategy {
            AttachmentStrategy::Mono => Attachments::Mono(None),
            AttachmentStrategy::FixedLength(capacity) => Attachments::FixedLength {
                slots: Vec::with_capacity(capacity),
                capacity,
            },
            AttachmentStrategy::Variable => Attachments::Variable(FxHashMap::default()),
        }
    }

    pub(crate) fn strategy(&self) -> AttachmentStrategy {
        match self {
            Attachments::Mono(_) => AttachmentStrategy::Mono,
            Attachments::FixedLength { capacity, .. } => AttachmentStrategy::FixedLength(*capacity),
            Attachments::Variable(_) => AttachmentStrategy::Variable,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Attachments::Mono(slot) => usize::from(slot.is_some()),
            Attachments::FixedLength { slots, .. } => slots.len(),
            Attachments::Variable(map) => map.len(),
        }
    }

    pub(crate) fn has_room(&self) -> bool {
        match self {
            Attachments::Mono(slot) => slot.is_none(),
            Attachments::FixedLength { slots, capacity } => slots.len() < *capacity,
            Attachments::Variable(_) => true,
        }
    }

    pub(crate) fn locate(&self, id: RefId) -> Option<&Slot> {
        match self {
            Attachments::Mono(slot) => slot.as_ref().filter(|t| t.ref_id() == id),
            Attachments::FixedLength { slots, .. } => slots.iter().find(|t| t.ref_id() == id),
            Attachments::Variable(map) => map.get(&id),
        }
    }

    pub(crate) fn locate_mut(&mut self, id: RefId) -> Option<&mut Slot> {
        match self {
            Attachments::Mono(slot) => slot.as_mut().filter(|t| t.ref_id() == id),
            Attachments::FixedLength { slots, .. } => slots.iter_mut().find(|t| t.ref_id() == id),
            Attachments::Variable(map) => map.get_mut(&id),
        }
    }

    /// Store a tranlocal for a reference not attached yet
    ///
    /// Hands the tranlocal back when no slot is free.
    pub(crate) fn attach(&mut self, tranlocal: Slot) -> Result<(), Slot> {
        if !self.has_room() {
            return Err(tranlocal);
        }
        match self {
            Attachments::Mono(slot) => *slot = Some(tranlocal),
            Attachments::FixedLength { slots, .. } => slots.push(tranlocal),
            Attachments::Variable(map) => {
                map.insert(tranlocal.ref_id(), tranlocal);
            }
        }
        Ok(())
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        match self {
            Attachments::Mono(slot) => Iter::Mono(slot.iter()),
            Attachments::FixedLength { slots, .. } => Iter::FixedLength(slots.iter()),
            Attachments::Variable(map) => Iter::Variable(map.values()),
        }
    }

    pub(crate) fn iter_mut(&mut self) -> IterMut<'_> {
        match self {
            Attachments::Mono(slot) => IterMut::Mono(slot.iter_mut()),
            Attachments::FixedLength { slots, .. } => IterMut::FixedLength(slots.iter_mut()),
            Attachments::Variable(map) => IterMut::Variable(map.values_mut()),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            Attachments::Mono(slot) => *slot = None,
            Attachments::FixedLength { slots, .. } => slots.clear(),
            Attachments::Variable(map) => map.clear(),
        }
    }
}

pub(crate) enum Iter<'a> {
    Mono(option::Iter<'a, Slot>),
    FixedLength(slice::Iter<'a, Slot>),
    Variable(hash_map::Values<'a, RefId, Slot>),
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Slot;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Iter::Mono(inner) => inner.next(),
            Iter::FixedLength(inner) => inner.next(),
            Iter::Variable(inner) => inner.next(),
        }
    }
}

pub(crate) enum IterMut<'a> {
    Mono(option::IterMut<'a, Slot>),
    FixedLength(slice::IterMut<'a, Slot>),
    Variable(hash_map::ValuesMut<'a, RefId, Slot>),
}

impl<'a> Iterator for IterMut<'a> {
    type Item = &'a mut Slot;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IterMut::Mono(inner) => inner.next(),
            IterMut::FixedLength(inner) => inner.next(),
            IterMut::Variable(inner) => inner.next(),
        }
    }
}
