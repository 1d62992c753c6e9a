//! Device identity table
//!
//! Maps a [`DeviceKey`] to the one live [`Device`] object of a context. Entries
//! are weak: the table never keeps a device alive, it only lets a repeated
//! enumeration find the object callers already hold.

use crate::backend::DeviceKey;
use crate::device::{Device, DeviceInner};
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
pub(crate) struct Registry {
    devices: Mutex<HashMap<DeviceKey, Weak<DeviceInner>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The live device for `key`, or a new one built by `make`
    ///
    /// Lookup and insert happen under one lock, so concurrent enumerations
    /// agree on a single object.
    pub(crate) fn resolve(&self, key: DeviceKey, make: impl FnOnce() -> Arc<DeviceInner>) -> Device {
        // Dropped after the guard: releasing it may re-enter `remove`
        let _released;
        let mut devices = lock(&self.devices);
        match devices.get(&key).and_then(Weak::upgrade) {
            Some(inner) if inner.is_live() => return Device::from_inner(inner),
            other => _released = other,
        }
        let inner = make();
        devices.insert(key, Arc::downgrade(&inner));
        Device::from_inner(inner)
    }

    /// Forget `key` if it still refers to `inner` or to a dead object
    pub(crate) fn remove(&self, key: DeviceKey, inner: *const DeviceInner) {
        let mut devices = lock(&self.devices);
        let stale = devices
            .get(&key)
            .is_some_and(|weak| weak.as_ptr() == inner || weak.strong_count() == 0);
        if stale {
            devices.remove(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.devices)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
