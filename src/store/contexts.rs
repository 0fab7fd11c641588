//! Operation contexts: the capability set user code supplies per call.
//!
//! The store is parameterised over plain traits rather than an inheritance
//! tree; monomorphisation removes the indirection on the hot path. The
//! `Simple*` implementations back the convenience methods on `Session`.

use crate::record::{Key, Value};

/// Capabilities of a read operation.
pub trait ReadContext<K: Key, V: Value>: Send {
    /// The key to look up.
    fn key(&self) -> &K;

    /// Called with the found value.
    fn visit(&mut self, value: &V);
}

/// Capabilities of an upsert operation.
pub trait UpsertContext<K: Key, V: Value>: Send {
    /// The key to write.
    fn key(&self) -> &K;

    /// The value to write.
    fn value(&self) -> &V;
}

/// Capabilities of a read-modify-write operation.
pub trait RmwContext<K: Key, V: Value>: Send {
    /// The key to modify.
    fn key(&self) -> &K;

    /// Value installed when the key is absent.
    fn initial(&self) -> V;

    /// Mutate the live value in place. Return false to refuse (forcing a
    /// copy-update at the tail), e.g. when the update would grow the value.
    fn update_in_place(&mut self, value: &mut V) -> bool;

    /// Produce the successor value from a read-only record.
    fn update_copy(&mut self, old: &V) -> V {
        let mut next = *old;
        self.update_in_place(&mut next);
        next
    }
}

/// Capabilities of a delete operation.
pub trait DeleteContext<K: Key>: Send {
    /// The key to delete.
    fn key(&self) -> &K;
}

/// Read context capturing the value.
pub struct SimpleReadContext<K: Key, V: Value> {
    /// The key to look up.
    pub key: K,
    /// The captured value, if found.
    pub value: Option<V>,
}

impl<K: Key, V: Value> SimpleReadContext<K, V> {
    /// Context for `key`.
    pub fn new(key: K) -> Self {
        Self { key, value: None }
    }
}

impl<K: Key, V: Value> ReadContext<K, V> for SimpleReadContext<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn visit(&mut self, value: &V) {
        self.value = Some(*value);
    }
}

/// Upsert context holding the pair to write.
pub struct SimpleUpsertContext<K: Key, V: Value> {
    /// The key to write.
    pub key: K,
    /// The value to write.
    pub value: V,
}

impl<K: Key, V: Value> UpsertContext<K, V> for SimpleUpsertContext<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn value(&self) -> &V {
        &self.value
    }
}

/// RMW context applying a closure.
pub struct ClosureRmwContext<K: Key, V: Value, F>
where
    F: FnMut(&mut V) -> bool + Send,
{
    /// The key to modify.
    pub key: K,
    /// Value installed when the key is absent.
    pub initial: V,
    /// The updater.
    pub update: F,
}

impl<K: Key, V: Value, F> RmwContext<K, V> for ClosureRmwContext<K, V, F>
where
    F: FnMut(&mut V) -> bool + Send,
{
    fn key(&self) -> &K {
        &self.key
    }

    fn initial(&self) -> V {
        self.initial
    }

    fn update_in_place(&mut self, value: &mut V) -> bool {
        (self.update)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_context_captures() {
        let mut ctx = SimpleReadContext::<u64, u64>::new(7);
        assert_eq!(*ctx.key(), 7);
        ctx.visit(&41);
        assert_eq!(ctx.value, Some(41));
    }

    #[test]
    fn closure_rmw_updates() {
        let mut ctx = ClosureRmwContext {
            key: 1u64,
            initial: 0u64,
            update: |v: &mut u64| {
                *v += 5;
                true
            },
        };
        let mut v = 10u64;
        assert!(ctx.update_in_place(&mut v));
        assert_eq!(v, 15);
        assert_eq!(ctx.update_copy(&20), 25);
    }
}
