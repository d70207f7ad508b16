// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Lookup table from the pair of interface and channel identifier to the handle of channel.

use {super::*, tracing::debug};

const BUCKET_COUNT: usize = 256;

struct Entry<T> {
    iface: InterfaceId,
    channel_id: usize,
    handle: T,
}

/// Hashed table with 256 buckets, guarded by a single lock.
pub struct ChannelRegistry<T: Clone> {
    buckets: Mutex<Vec<Vec<Entry<T>>>>,
}

impl<T: Clone> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self {
            buckets: Mutex::new((0..BUCKET_COUNT).map(|_| Vec::new()).collect()),
        }
    }
}

fn bucket_index(iface: InterfaceId, channel_id: usize) -> usize {
    let folded = iface.0.to_le_bytes().iter().fold(0u8, |acc, &b| acc ^ b);
    (folded ^ (channel_id as u8)) as usize
}

impl<T: Clone> ChannelRegistry<T> {
    pub fn register(&self, iface: InterfaceId, channel_id: usize, handle: T) -> Result<(), Error> {
        let mut buckets = lock(&self.buckets);
        let bucket = &mut buckets[bucket_index(iface, channel_id)];
        if bucket
            .iter()
            .any(|entry| entry.iface == iface && entry.channel_id == channel_id)
        {
            let msg = format!(
                "Channel {} of interface {} is already registered",
                channel_id, iface.0
            );
            Err(most_error(MostError::Busy, &msg))
        } else {
            debug!(iface = iface.0, channel_id, "register channel");
            bucket.push(Entry {
                iface,
                channel_id,
                handle,
            });
            Ok(())
        }
    }

    pub fn lookup(&self, iface: InterfaceId, channel_id: usize) -> Option<T> {
        let buckets = lock(&self.buckets);
        buckets[bucket_index(iface, channel_id)]
            .iter()
            .find(|entry| entry.iface == iface && entry.channel_id == channel_id)
            .map(|entry| entry.handle.clone())
    }

    /// Remove the entry matching both the interface and the channel identifier.
    pub fn unregister(&self, iface: InterfaceId, channel_id: usize) -> Option<T> {
        let mut buckets = lock(&self.buckets);
        let bucket = &mut buckets[bucket_index(iface, channel_id)];
        bucket
            .iter()
            .position(|entry| entry.iface == iface && entry.channel_id == channel_id)
            .map(|pos| {
                debug!(iface = iface.0, channel_id, "unregister channel");
                bucket.remove(pos).handle
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_lookup_and_busy() {
        let registry = ChannelRegistry::<usize>::default();
        registry.register(InterfaceId(0x1234), 3, 10).unwrap();
        registry.register(InterfaceId(0x1234), 4, 11).unwrap();
        let err = registry.register(InterfaceId(0x1234), 3, 12).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        assert_eq!(registry.lookup(InterfaceId(0x1234), 3), Some(10));
        assert_eq!(registry.lookup(InterfaceId(0x1234), 4), Some(11));
        assert_eq!(registry.lookup(InterfaceId(0x1235), 3), None);
    }

    #[test]
    fn registry_unregister_matches_both_keys() {
        let registry = ChannelRegistry::<usize>::default();
        // The two keys collide in the same bucket: 0x01 ^ 0 == 0x00 ^ 1.
        assert_eq!(
            bucket_index(InterfaceId(0x01), 0),
            bucket_index(InterfaceId(0x00), 1)
        );
        registry.register(InterfaceId(0x01), 0, 1).unwrap();
        registry.register(InterfaceId(0x00), 1, 2).unwrap();

        assert_eq!(registry.unregister(InterfaceId(0x01), 1), None);
        assert_eq!(registry.unregister(InterfaceId(0x00), 1), Some(2));
        assert_eq!(registry.lookup(InterfaceId(0x01), 0), Some(1));
        assert_eq!(registry.lookup(InterfaceId(0x00), 1), None);
    }
}
