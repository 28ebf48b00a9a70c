//! Generational slab stores for device resources.
//!
//! One [`Store`] exists per resource kind, bundled inside the device. A
//! slot's generation is bumped when it is freed, so handles held past
//! destruction are rejected instead of aliasing the slot's next tenant.
//! Freed slots thread through an intrusive free list and the slab only
//! ever grows (amortised doubling through `Vec`).

use std::marker::PhantomData;

use gatling_types::{Handle, MAX_HANDLE_GENERATION};
use thiserror::Error;

const FREE_LIST_END: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidHandle {
    #[error("{kind} handle {index} is stale: slot holds generation {current}, handle carries {given}")]
    Stale {
        kind: &'static str,
        index: u32,
        given: u32,
        current: u32,
    },
    #[error("{kind} handle {index} points at a destroyed resource")]
    Vacant { kind: &'static str, index: u32 },
    #[error("{kind} handle {index} was never allocated")]
    OutOfBounds { kind: &'static str, index: u32 },
}

#[derive(Debug)]
enum Element<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: u32 },
}

#[derive(Debug)]
pub(crate) struct Store<M, T> {
    elements: Vec<Element<T>>,
    free_head: u32,
    kind: &'static str,
    _marker: PhantomData<fn(M) -> M>,
}

impl<M, T> Store<M, T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            elements: Vec::new(),
            free_head: FREE_LIST_END,
            kind,
            _marker: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle<M> {
        if self.free_head != FREE_LIST_END {
            let index = self.free_head;
            let slot = &mut self.elements[index as usize];
            let &mut Element::Vacant {
                generation,
                next_free,
            } = slot
            else {
                unreachable!("free list points at an occupied slot");
            };
            self.free_head = next_free;
            *slot = Element::Occupied { generation, value };
            Handle::from_parts(index, generation)
        } else {
            let index = self.elements.len() as u32;
            self.elements.push(Element::Occupied {
                generation: 0,
                value,
            });
            Handle::from_parts(index, 0)
        }
    }

    pub fn get(&self, handle: Handle<M>) -> Result<&T, InvalidHandle> {
        match self.elements.get(handle.index() as usize) {
            Some(Element::Occupied { generation, value }) if *generation == handle.generation() => {
                Ok(value)
            }
            Some(Element::Occupied { generation, .. }) => Err(InvalidHandle::Stale {
                kind: self.kind,
                index: handle.index(),
                given: handle.generation(),
                current: *generation,
            }),
            Some(Element::Vacant { .. }) => Err(InvalidHandle::Vacant {
                kind: self.kind,
                index: handle.index(),
            }),
            None => Err(InvalidHandle::OutOfBounds {
                kind: self.kind,
                index: handle.index(),
            }),
        }
    }

    pub fn get_mut(&mut self, handle: Handle<M>) -> Result<&mut T, InvalidHandle> {
        match self.elements.get_mut(handle.index() as usize) {
            Some(Element::Occupied { generation, value }) if *generation == handle.generation() => {
                Ok(value)
            }
            Some(Element::Occupied { generation, .. }) => Err(InvalidHandle::Stale {
                kind: self.kind,
                index: handle.index(),
                given: handle.generation(),
                current: *generation,
            }),
            Some(Element::Vacant { .. }) => Err(InvalidHandle::Vacant {
                kind: self.kind,
                index: handle.index(),
            }),
            None => Err(InvalidHandle::OutOfBounds {
                kind: self.kind,
                index: handle.index(),
            }),
        }
    }

    /// Free the slot, bump its generation and return the evicted value.
    /// A second free of the same handle reports `Vacant` (or `Stale` once
    /// the slot has a new tenant) and is harmless.
    pub fn remove(&mut self, handle: Handle<M>) -> Result<T, InvalidHandle> {
        // Validate before committing to the swap.
        self.get(handle)?;
        let index = handle.index();
        let slot = &mut self.elements[index as usize];
        let next_generation = (handle.generation() + 1) & MAX_HANDLE_GENERATION;
        let old = std::mem::replace(
            slot,
            Element::Vacant {
                generation: next_generation,
                next_free: self.free_head,
            },
        );
        self.free_head = index;
        let Element::Occupied { value, .. } = old else {
            unreachable!("validated above");
        };
        Ok(value)
    }

    /// Empty the store, yielding every live value. Used by device
    /// teardown.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.free_head = FREE_LIST_END;
        self.elements
            .drain(..)
            .filter_map(|element| match element {
                Element::Occupied { value, .. } => Some(value),
                Element::Vacant { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements
            .iter()
            .filter(|e| matches!(e, Element::Occupied { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum TestMarker {}
    type TestStore = Store<TestMarker, String>;

    #[test]
    fn free_then_get_is_stale() {
        let mut store = TestStore::new("test");
        let h = store.insert("a".into());
        assert_eq!(store.get(h).unwrap(), "a");
        store.remove(h).unwrap();
        assert!(matches!(store.get(h), Err(InvalidHandle::Vacant { .. })));
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut store = TestStore::new("test");
        let h1 = store.insert("a".into());
        store.remove(h1).unwrap();
        let h2 = store.insert("b".into());
        // The slot is reused but the generation differs, so the old
        // handle stays dead.
        assert_eq!(h2.index(), h1.index());
        assert_ne!(h2.generation(), h1.generation());
        assert!(matches!(store.get(h1), Err(InvalidHandle::Stale { .. })));
        assert_eq!(store.get(h2).unwrap(), "b");
    }

    #[test]
    fn double_free_is_reported_not_fatal() {
        let mut store = TestStore::new("test");
        let h = store.insert("a".into());
        store.remove(h).unwrap();
        assert!(store.remove(h).is_err());
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let store = TestStore::new("test");
        let h = Handle::<TestMarker>::from_parts(3, 0);
        assert!(matches!(
            store.get(h),
            Err(InvalidHandle::OutOfBounds { .. })
        ));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut store = TestStore::new("test");
        let handles: Vec<_> = (0..4).map(|i| store.insert(format!("{i}"))).collect();
        store.remove(handles[1]).unwrap();
        store.remove(handles[3]).unwrap();
        assert_eq!(store.insert("x".into()).index(), 3);
        assert_eq!(store.insert("y".into()).index(), 1);
        assert_eq!(store.insert("z".into()).index(), 4);
        assert_eq!(store.len(), 5);
    }
}
