// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Buffer object exchanged between hardware interface and consumers of channel.
//!
//! The module includes the structure for MOST buffer object (MBO), the trait for hardware interface
//! which owns the buffer objects, and a pool of buffer objects tagged with generation so that any
//! buffer returned twice or to the wrong pool is detected.

use {
    super::*,
    std::{collections::VecDeque, sync::Weak},
    tracing::{debug, error},
};

/// The status of buffer object at completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MboStatus {
    Success,
    Invalid,
    /// The channel was closed while the buffer was in flight.
    Close,
}

impl Default for MboStatus {
    fn default() -> Self {
        Self::Success
    }
}

/// The identity of buffer object in its pool.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct MboTag {
    /// The index of slot in the pool.
    pub slot: usize,
    /// Incremented every time the slot is handed out.
    pub generation: u64,
}

/// The operations of hardware interface, which owns channels and buffer objects.
///
/// Completions of buffer objects are delivered by the implementation through
/// [`crate::mlb150::Mlb150::rx_completion`] and [`crate::mlb150::Mlb150::tx_completion`]. The
/// implementation should not hold its own locks when delivering them.
pub trait MostInterface: Send + Sync {
    /// The stable identifier of interface.
    fn id(&self) -> InterfaceId;

    /// Take an empty buffer object for the channel, if available.
    fn get_mbo(&self, channel_id: usize) -> Option<Mbo>;

    /// Whether any buffer object is available for the channel.
    fn has_mbo(&self, channel_id: usize) -> bool;

    /// Return the buffer object to its pool.
    fn put_mbo(&self, mbo: Mbo);

    /// Queue the buffer object to the hardware for transmission.
    fn submit_mbo(&self, mbo: Mbo);

    /// Start exchanging buffer objects over the channel.
    fn start_channel(&self, channel_id: usize, config: &ChannelConfig) -> Result<(), Error>;

    /// Stop exchanging, then return any in-flight buffer object to the pool.
    fn stop_channel(&self, channel_id: usize) -> Result<(), Error>;
}

/// MOST buffer object. It is owned exclusively by one of the pool, a FIFO of channel, an
/// extension, or the transport.
pub struct Mbo {
    data: Box<[u8]>,
    processed_length: usize,
    buffer_length: usize,
    status: MboStatus,
    iface: InterfaceId,
    channel_id: usize,
    tag: MboTag,
    home: Option<Weak<dyn MostInterface>>,
}

impl std::fmt::Debug for Mbo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mbo")
            .field("capacity", &self.data.len())
            .field("processed_length", &self.processed_length)
            .field("buffer_length", &self.buffer_length)
            .field("status", &self.status)
            .field("iface", &self.iface)
            .field("channel_id", &self.channel_id)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Mbo {
    /// Instantiate buffer object which belongs to no pool.
    pub fn new(iface: InterfaceId, channel_id: usize, capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            processed_length: 0,
            buffer_length: capacity,
            status: Default::default(),
            iface,
            channel_id,
            tag: Default::default(),
            home: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    pub fn processed_length(&self) -> usize {
        self.processed_length
    }

    pub fn status(&self) -> MboStatus {
        self.status
    }

    pub fn iface(&self) -> InterfaceId {
        self.iface
    }

    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    pub fn tag(&self) -> MboTag {
        self.tag
    }

    pub fn set_status(&mut self, status: MboStatus) {
        self.status = status;
    }

    /// Change the length of valid area. It should not be shorter than processed length.
    pub fn set_buffer_length(&mut self, len: usize) -> Result<(), Error> {
        if len > self.data.len() || len < self.processed_length {
            let msg = format!(
                "Buffer length {} out of range {}..={}",
                len,
                self.processed_length,
                self.data.len()
            );
            Err(most_error(MostError::Inval, &msg))
        } else {
            self.buffer_length = len;
            Ok(())
        }
    }

    pub fn clear_processed_length(&mut self) {
        self.processed_length = 0;
    }

    pub fn set_processed_length(&mut self, len: usize) -> Result<(), Error> {
        if len > self.buffer_length {
            let msg = format!(
                "Processed length {} exceeds buffer length {}",
                len, self.buffer_length
            );
            Err(most_error(MostError::Inval, &msg))
        } else {
            self.processed_length = len;
            Ok(())
        }
    }

    /// The bytes processed by hardware, or filled by producer.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.processed_length]
    }

    /// The valid area of buffer.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.buffer_length]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.buffer_length]
    }

    /// Copy the bytes to the head of buffer and mark them as processed.
    pub fn set_payload(&mut self, src: &[u8]) -> Result<(), Error> {
        if src.len() > self.buffer_length {
            let msg = format!(
                "Payload length {} exceeds buffer length {}",
                src.len(),
                self.buffer_length
            );
            Err(most_error(MostError::Inval, &msg))?;
        }
        self.data[..src.len()].copy_from_slice(src);
        self.processed_length = src.len();
        Ok(())
    }

    /// Give the buffer object back to the interface which owns it.
    pub fn put(self) {
        match self.home.as_ref().and_then(|home| home.upgrade()) {
            Some(iface) => iface.put_mbo(self),
            None => debug!(tag = ?self.tag, "drop buffer object without owner"),
        }
    }

    /// Hand the buffer object to the interface for transmission.
    pub fn submit(self) {
        match self.home.as_ref().and_then(|home| home.upgrade()) {
            Some(iface) => iface.submit_mbo(self),
            None => debug!(tag = ?self.tag, "drop submitted buffer object without owner"),
        }
    }
}

#[derive(Default)]
struct PoolSlot {
    generation: u64,
    data: Option<Box<[u8]>>,
}

/// The pool of buffer objects for a channel of interface.
pub struct MboPool {
    iface: InterfaceId,
    channel_id: usize,
    size: usize,
    home: Option<Weak<dyn MostInterface>>,
    slots: Vec<PoolSlot>,
    free: VecDeque<usize>,
}

impl MboPool {
    pub fn new(iface: InterfaceId, channel_id: usize, count: usize, size: usize) -> Self {
        let mut pool = Self {
            iface,
            channel_id,
            size,
            home: None,
            slots: Default::default(),
            free: Default::default(),
        };
        pool.allocate(count, size);
        pool
    }

    /// Buffer objects taken from the pool are returned through the interface.
    pub fn with_home(mut self, home: Weak<dyn MostInterface>) -> Self {
        self.home = Some(home);
        self
    }

    fn allocate(&mut self, count: usize, size: usize) {
        self.size = size;
        self.slots = (0..count)
            .map(|_| PoolSlot {
                generation: 0,
                data: Some(vec![0; size].into_boxed_slice()),
            })
            .collect();
        self.free = (0..count).collect();
    }

    /// Re-allocate buffers. Any outstanding buffer prevents it.
    pub fn reset(&mut self, count: usize, size: usize) -> Result<(), Error> {
        if self.outstanding() > 0 {
            let msg = format!("{} buffer objects are outstanding", self.outstanding());
            Err(most_error(MostError::Busy, &msg))
        } else {
            self.allocate(count, size);
            Ok(())
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn get(&mut self) -> Option<Mbo> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index];
        let data = slot.data.take()?;
        slot.generation += 1;
        let buffer_length = data.len();

        Some(Mbo {
            data,
            processed_length: 0,
            buffer_length,
            status: MboStatus::Success,
            iface: self.iface,
            channel_id: self.channel_id,
            tag: MboTag {
                slot: index,
                generation: slot.generation,
            },
            home: self.home.clone(),
        })
    }

    pub fn put(&mut self, mbo: Mbo) -> Result<(), Error> {
        let tag = mbo.tag;
        let known = mbo.iface == self.iface
            && mbo.channel_id == self.channel_id
            && self
                .slots
                .get(tag.slot)
                .map(|slot| slot.data.is_none() && slot.generation == tag.generation)
                .unwrap_or(false);

        if !known {
            error!(
                ?tag,
                iface = mbo.iface.0,
                channel_id = mbo.channel_id,
                "foreign buffer object returned to pool"
            );
            let msg = format!("Buffer object {:?} does not belong to the pool", tag);
            Err(most_error(MostError::Inval, &msg))
        } else {
            self.slots[tag.slot].data = Some(mbo.data);
            self.free.push_back(tag.slot);
            Ok(())
        }
    }
}
