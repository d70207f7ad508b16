// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Exclusive claim of aim channel by callback-driven consumer.
//!
//! Once an extension locks the channel, completions of buffer objects are delivered to the
//! extension instead of the FIFO of the channel, and the blocking I/O of the channel is refused.

use {
    super::{
        mbo::Mbo,
        mlb150::{AccessMode, Mlb150, SyncStartupMode},
        *,
    },
    std::sync::{Arc, Weak},
    tracing::debug,
};

/// The class of extension, matched against the data type of channel at registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtensionClass {
    Control,
    Async,
    Isoc,
    Sync,
}

impl ExtensionClass {
    pub(crate) fn data_type(&self) -> ChannelDataType {
        match self {
            ExtensionClass::Control => ChannelDataType::Control,
            ExtensionClass::Async => ChannelDataType::Async,
            ExtensionClass::Isoc => ChannelDataType::Isoc,
            ExtensionClass::Sync => ChannelDataType::Sync,
        }
    }
}

impl std::fmt::Display for ExtensionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            ExtensionClass::Control => "ctrl",
            ExtensionClass::Async => "async",
            ExtensionClass::Isoc => "isoc",
            ExtensionClass::Sync => "sync",
        };
        write!(f, "{}", label)
    }
}

/// The geometry of blocks for isochronous channel, captured when the channel is opened.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockGeometry {
    /// The size of block in bytes.
    pub size: usize,
    /// The number of blocks in a buffer object.
    pub count: usize,
}

/// The callbacks of extension. They are called without any lock of the channel, except for
/// `cleanup()` which runs while the channel is torn down.
pub trait Extension: Send + Sync {
    /// Called at registration, before the extension is visible to the channel.
    fn setup(&self, _link: &ExtensionLink) -> Result<(), Error> {
        Ok(())
    }

    /// A buffer object arrives. The extension owns it and should release it eventually.
    fn rx(&self, mbo: Mbo) {
        mbo.put();
    }

    /// A buffer object for transmission is available again.
    fn tx(&self) {}

    /// The channel is torn down. Any buffer object held by the extension should be released.
    fn cleanup(&self) {}
}

struct ExtState {
    locked: Option<(u64, Arc<dyn Extension>)>,
    registered: Vec<(u64, Arc<dyn Extension>)>,
    geometry: BlockGeometry,
}

/// The lock of channel by extension. It is held just for short critical sections.
pub(crate) struct ExtLock(Mutex<ExtState>);

impl Default for ExtLock {
    fn default() -> Self {
        Self(Mutex::new(ExtState {
            locked: None,
            registered: Default::default(),
            geometry: Default::default(),
        }))
    }
}

impl ExtLock {
    pub(crate) fn current(&self) -> Option<Arc<dyn Extension>> {
        lock(&self.0).locked.as_ref().map(|(_, ext)| ext.clone())
    }

    pub(crate) fn is_locked(&self) -> bool {
        lock(&self.0).locked.is_some()
    }

    pub(crate) fn is_holder(&self, id: u64) -> bool {
        lock(&self.0)
            .locked
            .as_ref()
            .map(|(holder, _)| *holder == id)
            .unwrap_or(false)
    }

    pub(crate) fn geometry(&self) -> BlockGeometry {
        lock(&self.0).geometry
    }

    pub(crate) fn set_geometry(&self, geometry: BlockGeometry) {
        lock(&self.0).geometry = geometry;
    }

    pub(crate) fn register(&self, id: u64, ext: Arc<dyn Extension>) {
        lock(&self.0).registered.push((id, ext));
    }

    /// Returns the extension when it held the lock.
    pub(crate) fn unregister(&self, id: u64) -> Option<Arc<dyn Extension>> {
        let mut state = lock(&self.0);
        state.registered.retain(|(entry, _)| *entry != id);
        let holder = state.locked.as_ref().map(|(holder, _)| *holder);
        if holder == Some(id) {
            state.locked.take().map(|(_, ext)| ext)
        } else {
            None
        }
    }

    pub(crate) fn lock(&self, name: &str, id: u64, on: bool) -> Result<(), Error> {
        let mut state = lock(&self.0);
        let holder = state.locked.as_ref().map(|(holder, _)| *holder);
        if on {
            match holder {
                Some(holder) if holder == id => Ok(()),
                Some(holder) => {
                    debug!(name, holder, id, "channel already locked, refused");
                    let msg = format!("{} is already locked by extension {}", name, holder);
                    Err(most_error(MostError::Busy, &msg))
                }
                None => {
                    let ext = state
                        .registered
                        .iter()
                        .find(|(entry, _)| *entry == id)
                        .map(|(_, ext)| ext.clone())
                        .ok_or_else(|| {
                            let msg = format!("Extension {} is not registered to {}", id, name);
                            most_error(MostError::Inval, &msg)
                        })?;
                    debug!(name, id, "channel locked");
                    state.locked = Some((id, ext));
                    Ok(())
                }
            }
        } else {
            if let Some(holder) = holder {
                debug!(name, holder, id, "channel lock released");
            }
            state.locked = None;
            Ok(())
        }
    }
}

/// The handle of registration, used by the extension to operate its channel.
#[derive(Clone)]
pub struct ExtensionLink {
    pub(crate) mlb: Weak<Mlb150>,
    pub(crate) index: usize,
    pub(crate) id: u64,
    pub(crate) class: ExtensionClass,
    pub(crate) minor: usize,
}

impl std::fmt::Debug for ExtensionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExtensionLink")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("class", &self.class)
            .field("minor", &self.minor)
            .finish()
    }
}

impl ExtensionLink {
    fn mlb(&self) -> Result<Arc<Mlb150>, Error> {
        self.mlb
            .upgrade()
            .ok_or_else(|| most_error(MostError::NoDev, "The channel set is already released"))
    }

    pub fn class(&self) -> ExtensionClass {
        self.class
    }

    /// The index of channel in the class.
    pub fn minor(&self) -> usize {
        self.minor
    }

    /// The name of channel.
    pub fn name(&self) -> String {
        self.mlb
            .upgrade()
            .and_then(|mlb| mlb.channel_name(self.index).map(|name| name.to_string()))
            .unwrap_or_default()
    }

    /// Claim the channel exclusively, or release it.
    pub fn lock(&self, on: bool) -> Result<(), Error> {
        let mlb = self.mlb()?;
        mlb.lock_channel(self.index, self.id, on)
    }

    pub fn is_locked(&self) -> bool {
        self.mlb
            .upgrade()
            .map(|mlb| mlb.is_locked_by(self.index, self.id))
            .unwrap_or(false)
    }

    /// Remove the extension from the channel. The lock is released when held.
    pub fn unregister(&self) {
        if let Some(mlb) = self.mlb.upgrade() {
            mlb.unregister_extension(self.index, self.id);
        }
    }

    /// Take a buffer object for transmission. The extension should hold the lock.
    pub fn get_tx_mbo(&self) -> Result<Mbo, Error> {
        let mlb = self.mlb()?;
        mlb.extension_tx_mbo(self.index, self.id)
    }

    /// The block geometry captured when the channel was opened.
    pub fn geometry(&self) -> BlockGeometry {
        self.mlb
            .upgrade()
            .map(|mlb| mlb.block_geometry(self.index))
            .unwrap_or_default()
    }

    /// The configuration of channel while it is started.
    pub fn channel_config(&self) -> Option<ChannelConfig> {
        self.mlb
            .upgrade()
            .and_then(|mlb| mlb.bound_config(self.index))
    }

    pub fn set_address(&self, caddr: u32) -> Result<(), Error> {
        let mlb = self.mlb()?;
        mlb.set_address(self.index, caddr)
    }

    pub fn startup(&self, access: AccessMode) -> Result<(), Error> {
        let mlb = self.mlb()?;
        mlb.startup(self.index, access)
    }

    pub fn sync_startup(&self, access: AccessMode, mode: SyncStartupMode) -> Result<(), Error> {
        let mlb = self.mlb()?;
        mlb.sync_startup(self.index, access, mode)
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        let mlb = self.mlb()?;
        mlb.shutdown(self.index)
    }
}
