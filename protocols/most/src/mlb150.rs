// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Channels emulating the character devices of MLB150 controller.
//!
//! The set of channels is fixed at instantiation: a number of synchronous channels named
//! `sync{N}` followed by isochronous channels named `isoc` (or `isoc{N}` for several). Each of
//! them is bound to one of the MLB channel slots (1..=63) by channel address, then started for
//! either direction.

use {
    super::{aim::*, extension::*, mbo::*, registry::ChannelRegistry, *},
    nix::poll::PollFlags,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    tracing::debug,
};

pub const MLB_FIRST_CHANNEL: usize = 1;
pub const MLB_LAST_CHANNEL: usize = 63;

pub const MLB_MAX_SYNC_DEVICES: usize = 7;
pub const MLB_MAX_ISOC_DEVICES: usize = 4;

pub const CH_ISOC_BLK_SIZE_MIN: usize = 188;
pub const CH_ISOC_BLK_SIZE_MAX: usize = 206;
pub const CH_ISOC_BLK_SIZE_DEFAULT: usize = 188;
pub const CH_ISOC_BLK_NUM_MIN: usize = 3;
pub const CH_ISOC_BLK_NUM_DEFAULT: usize = 8;

const SYNC_FCNT_VALUE: usize = 5;

/// The depth of buffer for synchronous channel, in bytes.
pub const fn sync_buffer_depth(bytes_per_frame: usize) -> usize {
    4 * (1 << SYNC_FCNT_VALUE) * bytes_per_frame
}

pub const SYNC_DMA_MIN_SIZE: usize = sync_buffer_depth(2);
pub const SYNC_DMA_MAX_SIZE: usize = 0x2000;

/// The lock bit of MLBC0 register.
pub const MLBC0_MLBLK: u32 = 1 << 7;
/// The last known version of MLB150 with lock bit.
pub const MLB150_VERSION: u32 = 0x03030003 | MLBC0_MLBLK;

const FPT_TABLE_SIZE: usize = 10;
const TRANSACTION_SIZE: usize = 512;

/// The mode of access to channel file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn direction(&self) -> Option<ChannelDirection> {
        match self {
            AccessMode::ReadOnly => Some(ChannelDirection::Rx),
            AccessMode::WriteOnly => Some(ChannelDirection::Tx),
            AccessMode::ReadWrite => None,
        }
    }
}

/// The mode to start synchronous channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncStartupMode {
    MonoRx,
    MonoTx,
    StereoRx,
    StereoTx,
    Surround51Rx,
    Surround51Tx,
    Surround51HqRx,
    Surround51HqTx,
    StereoHqRx,
    StereoHqTx,
}

impl SyncStartupMode {
    pub const ALL: [Self; FPT_TABLE_SIZE] = [
        Self::MonoRx,
        Self::MonoTx,
        Self::StereoRx,
        Self::StereoTx,
        Self::Surround51Rx,
        Self::Surround51Tx,
        Self::Surround51HqRx,
        Self::Surround51HqTx,
        Self::StereoHqRx,
        Self::StereoHqTx,
    ];

    pub fn from_raw(val: u32) -> Option<Self> {
        Self::ALL.iter().find(|mode| mode.index() as u32 == val).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            Self::MonoRx => 0,
            Self::MonoTx => 1,
            Self::StereoRx => 2,
            Self::StereoTx => 3,
            Self::Surround51Rx => 4,
            Self::Surround51Tx => 5,
            Self::Surround51HqRx => 6,
            Self::Surround51HqTx => 7,
            Self::StereoHqRx => 8,
            Self::StereoHqTx => 9,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        match self {
            Self::MonoRx | Self::MonoTx => 2,
            Self::StereoRx | Self::StereoTx => 4,
            Self::Surround51Rx | Self::Surround51Tx => 12,
            Self::Surround51HqRx | Self::Surround51HqTx => 18,
            Self::StereoHqRx | Self::StereoHqTx => 6,
        }
    }

    /// Find the mode for the layout of frame and the direction.
    pub fn from_layout(
        channels: usize,
        bytes_per_sample: usize,
        direction: ChannelDirection,
    ) -> Option<Self> {
        let rx = direction == ChannelDirection::Rx;
        let mode = match (channels, bytes_per_sample) {
            (1, 2) => if rx { Self::MonoRx } else { Self::MonoTx },
            (2, 2) => if rx { Self::StereoRx } else { Self::StereoTx },
            (2, 3) => if rx { Self::StereoHqRx } else { Self::StereoHqTx },
            (6, 2) => if rx { Self::Surround51Rx } else { Self::Surround51Tx },
            (6, 3) => if rx { Self::Surround51HqRx } else { Self::Surround51HqTx },
            _ => return None,
        };
        Some(mode)
    }

    // The notation in parameters of channel, like "2x16".
    fn from_notation(notation: &str, direction: ChannelDirection) -> Option<Self> {
        [("1x16", 1, 2), ("2x16", 2, 2), ("2x24", 2, 3), ("6x16", 6, 2), ("6x24", 6, 3)]
            .iter()
            .find(|(label, _, _)| label.eq_ignore_ascii_case(notation))
            .and_then(|&(_, channels, bytes)| Self::from_layout(channels, bytes, direction))
    }
}

const ISOC_FRAME_SIZES: [usize; 4] = [188, 192, 196, 206];

fn isoc_frame_size_index(size: usize) -> Option<usize> {
    ISOC_FRAME_SIZES.iter().position(|&s| s == size)
}

fn default_fpt_table(data_type: ChannelDataType) -> [usize; FPT_TABLE_SIZE] {
    let mut table = [0; FPT_TABLE_SIZE];
    match data_type {
        ChannelDataType::Sync => {
            SyncStartupMode::ALL
                .iter()
                .for_each(|mode| table[mode.index()] = TRANSACTION_SIZE / mode.bytes_per_frame());
        }
        ChannelDataType::Isoc => {
            ISOC_FRAME_SIZES
                .iter()
                .enumerate()
                .for_each(|(i, size)| table[i] = TRANSACTION_SIZE / size);
        }
        _ => (),
    }
    table
}

// Parse white-space separated list of "<mode>,<frames per transaction>". An invalid number
// restores the default value. An unknown mode stops parsing.
fn parse_channel_params(table: &mut [usize; FPT_TABLE_SIZE], cfg: &ChannelConfig, text: &str) {
    let defaults = default_fpt_table(cfg.data_type);
    for entry in text.split_whitespace() {
        let (mode, value) = match entry.split_once(',') {
            Some(pair) => pair,
            None => break,
        };
        let index = match cfg.data_type {
            ChannelDataType::Sync => {
                SyncStartupMode::from_notation(mode, cfg.direction).map(|mode| mode.index())
            }
            ChannelDataType::Isoc => mode.parse::<usize>().ok().and_then(isoc_frame_size_index),
            _ => None,
        };
        let index = match index {
            Some(index) => index,
            None => break,
        };
        table[index] = parse_uint(value)
            .map(|fpt| fpt as usize)
            .unwrap_or(defaults[index]);
    }
}

/// Parameters of the channel set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Mlb150Params {
    /// The number of synchronous channels.
    pub sync_channels: usize,
    /// The number of isochronous channels.
    pub isoc_channels: usize,
    /// The size of block for isochronous channel.
    pub isoc_blk_sz: usize,
    /// The number of blocks in a buffer for isochronous channel.
    pub isoc_blk_num: usize,
}

impl Default for Mlb150Params {
    fn default() -> Self {
        Self {
            sync_channels: MLB_MAX_SYNC_DEVICES,
            isoc_channels: 1,
            isoc_blk_sz: CH_ISOC_BLK_SIZE_DEFAULT,
            isoc_blk_num: CH_ISOC_BLK_NUM_DEFAULT,
        }
    }
}

impl Mlb150Params {
    pub fn set_isoc_blk_sz(&mut self, size: usize) -> Result<(), Error> {
        if size < CH_ISOC_BLK_SIZE_MIN || size > CH_ISOC_BLK_SIZE_MAX {
            let msg = format!(
                "Block size {} out of range {}..={}",
                size, CH_ISOC_BLK_SIZE_MIN, CH_ISOC_BLK_SIZE_MAX
            );
            Err(most_error(MostError::Inval, &msg))
        } else {
            self.isoc_blk_sz = size;
            Ok(())
        }
    }

    pub fn set_isoc_blk_num(&mut self, count: usize) -> Result<(), Error> {
        if count < CH_ISOC_BLK_NUM_MIN {
            let msg = format!(
                "Block count {} less than {}",
                count, CH_ISOC_BLK_NUM_MIN
            );
            Err(most_error(MostError::Inval, &msg))
        } else {
            self.isoc_blk_num = count;
            Ok(())
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.sync_channels > MLB_MAX_SYNC_DEVICES {
            let msg = format!(
                "{} sync channels exceed {}",
                self.sync_channels, MLB_MAX_SYNC_DEVICES
            );
            Err(most_error(MostError::Inval, &msg))?;
        }
        if self.isoc_channels > MLB_MAX_ISOC_DEVICES {
            let msg = format!(
                "{} isoc channels exceed {}",
                self.isoc_channels, MLB_MAX_ISOC_DEVICES
            );
            Err(most_error(MostError::Inval, &msg))?;
        }
        let mut params = Self::default();
        params.set_isoc_blk_sz(self.isoc_blk_sz)?;
        params.set_isoc_blk_num(self.isoc_blk_num)?;
        Ok(())
    }
}

/// The request to channel file, corresponding to ioctl of MLB150 driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mlb150Request {
    /// Set channel address; transmit slot in higher 16 bits, receive slot in lower 16 bits.
    ChanSetAddr(u32),
    /// Start isochronous channel for the access mode of file.
    ChanStartup,
    /// Start synchronous channel in the mode for the access mode of file.
    SyncChanStartup(u32),
    ChanShutdown,
    GetLock,
    GetIsocBufsize,
    GetVersion,
    SetFps(u32),
    SetDevAddr(u32),
}

#[derive(Default)]
struct MostSlot {
    cfg: Option<ChannelConfig>,
    iface: Option<Arc<dyn MostInterface>>,
    channel_id: usize,
    aim: Option<usize>,
    fpt: [usize; FPT_TABLE_SIZE],
}

/// The set of channels and MLB channel slots.
pub struct Mlb150 {
    params: Mutex<Mlb150Params>,
    sync_channels: usize,
    isoc_channels: usize,
    slots: Vec<Mutex<MostSlot>>,
    aims: Vec<AimChannel>,
    registry: ChannelRegistry<usize>,
    next_ext_id: AtomicU64,
}

impl std::fmt::Debug for Mlb150 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mlb150")
            .field("sync_channels", &self.sync_channels)
            .field("isoc_channels", &self.isoc_channels)
            .finish()
    }
}

impl Mlb150 {
    pub fn new(params: Mlb150Params) -> Result<Arc<Self>, Error> {
        params.validate()?;

        let aims = (0..(params.sync_channels + params.isoc_channels))
            .map(|i| {
                if i < params.sync_channels {
                    AimChannel::new(format!("sync{}", i), ChannelDataType::Sync, SYNC_DMA_MIN_SIZE)
                } else if params.isoc_channels > 1 {
                    let name = format!("isoc{}", i - params.sync_channels);
                    AimChannel::new(name, ChannelDataType::Isoc, 0)
                } else {
                    AimChannel::new("isoc".to_string(), ChannelDataType::Isoc, 0)
                }
            })
            .collect();

        debug!(
            sync = params.sync_channels,
            isoc = params.isoc_channels,
            "channel set"
        );

        Ok(Arc::new(Self {
            params: Mutex::new(params),
            sync_channels: params.sync_channels,
            isoc_channels: params.isoc_channels,
            slots: (0..=MLB_LAST_CHANNEL).map(|_| Default::default()).collect(),
            aims,
            registry: Default::default(),
            next_ext_id: AtomicU64::new(0),
        }))
    }

    pub fn params(&self) -> Mlb150Params {
        *lock(&self.params)
    }

    pub fn channel_count(&self) -> usize {
        self.aims.len()
    }

    pub fn sync_channel_count(&self) -> usize {
        self.sync_channels
    }

    pub fn isoc_channel_count(&self) -> usize {
        self.isoc_channels
    }

    pub fn channel_name(&self, index: usize) -> Option<&str> {
        self.aims.get(index).map(|aim| aim.name.as_str())
    }

    pub fn find_channel(&self, name: &str) -> Option<usize> {
        self.aims.iter().position(|aim| aim.name == name)
    }

    fn aim(&self, index: usize) -> Result<&AimChannel, Error> {
        self.aims.get(index).ok_or_else(|| {
            let msg = format!("Channel {} is not available", index);
            most_error(MostError::NoDev, &msg)
        })
    }

    pub fn isoc_blk_sz_show(&self) -> String {
        format!("{}\n", lock(&self.params).isoc_blk_sz)
    }

    pub fn isoc_blk_sz_store(&self, text: &str) -> Result<(), Error> {
        let val = parse_uint(text)
            .ok_or_else(|| most_error(MostError::Inval, "Invalid number for block size"))?;
        lock(&self.params).set_isoc_blk_sz(val as usize)
    }

    pub fn isoc_blk_num_show(&self) -> String {
        format!("{}\n", lock(&self.params).isoc_blk_num)
    }

    pub fn isoc_blk_num_store(&self, text: &str) -> Result<(), Error> {
        let val = parse_uint(text)
            .ok_or_else(|| most_error(MostError::Inval, "Invalid number for block count"))?;
        lock(&self.params).set_isoc_blk_num(val as usize)
    }

    /// Link the channel of interface to MLB channel slot. The name is `<id>[/<params>]`.
    pub fn probe_channel(
        &self,
        iface: Arc<dyn MostInterface>,
        channel_id: usize,
        cfg: ChannelConfig,
        name: &str,
    ) -> Result<(), Error> {
        if cfg.data_type != ChannelDataType::Sync && cfg.data_type != ChannelDataType::Isoc {
            let msg = format!("Data type {:?} is not supported", cfg.data_type);
            Err(most_error(MostError::Inval, &msg))?;
        }

        let (id_text, params) = match name.split_once('/') {
            Some((id_text, params)) => (id_text, Some(params)),
            None => (name, None),
        };
        if id_text.is_empty() {
            Err(most_error(MostError::Inval, "Channel name is empty"))?;
        }
        let id = parse_uint(id_text)
            .map(|id| id as usize)
            .filter(|id| *id >= MLB_FIRST_CHANNEL && *id <= MLB_LAST_CHANNEL)
            .ok_or_else(|| {
                let msg = format!("Invalid MLB channel: {}", id_text);
                most_error(MostError::Nxio, &msg)
            })?;

        let mut slot = lock(&self.slots[id]);
        if slot.cfg.is_some() {
            let msg = format!("MLB channel {} is already linked", id);
            Err(most_error(MostError::Busy, &msg))?;
        }

        self.registry.register(iface.id(), channel_id, id)?;

        let mut fpt = default_fpt_table(cfg.data_type);
        if let Some(text) = params {
            parse_channel_params(&mut fpt, &cfg, text);
        }

        debug!(
            id,
            iface = iface.id().0,
            channel_id,
            data_type = ?cfg.data_type,
            "MLB channel linked"
        );

        *slot = MostSlot {
            cfg: Some(cfg),
            iface: Some(iface),
            channel_id,
            aim: None,
            fpt,
        };

        Ok(())
    }

    /// Unlink the channel of interface. Any bound channel file is torn down.
    pub fn disconnect_channel(&self, iface: InterfaceId, channel_id: usize) -> Result<(), Error> {
        let id = self.registry.unregister(iface, channel_id).ok_or_else(|| {
            let msg = format!("Channel {} of interface {} is unknown", channel_id, iface.0);
            most_error(MostError::Nxio, &msg)
        })?;

        debug!(id, iface = iface.0, channel_id, "disconnect MLB channel");

        let aim_index = lock(&self.slots[id]).aim;
        if let Some(aim) = aim_index.and_then(|index| self.aims.get(index)) {
            if let Some(ext) = aim.ext.current() {
                ext.cleanup();
            }
            let mut io = lock(&aim.io);
            if io.binding.as_ref().map(|binding| binding.slot) == Some(id) {
                aim.unbind_fifo(&mut io);
                io.binding = None;
            }
        }

        *lock(&self.slots[id]) = Default::default();

        Ok(())
    }

    /// Deliver the received buffer object to the channel bound to the slot.
    pub fn rx_completion(&self, mbo: Mbo) -> Result<(), Error> {
        let id = match self.registry.lookup(mbo.iface(), mbo.channel_id()) {
            Some(id) => id,
            None => {
                debug!(
                    iface = mbo.iface().0,
                    channel_id = mbo.channel_id(),
                    "spurious buffer object"
                );
                let msg = format!(
                    "Channel {} of interface {} is unknown",
                    mbo.channel_id(),
                    mbo.iface().0
                );
                mbo.put();
                return Err(most_error(MostError::Nxio, &msg));
            }
        };

        let aim_index = self.slots.get(id).and_then(|slot| lock(slot).aim);
        match aim_index.and_then(|index| self.aims.get(index)) {
            Some(aim) => match aim.ext.current() {
                Some(ext) => ext.rx(mbo),
                None => aim.enqueue_rx(mbo),
            },
            None => {
                debug!(id, "no channel file bound");
                mbo.put();
            }
        }

        Ok(())
    }

    /// Notify that a buffer object for transmission is available again.
    pub fn tx_completion(&self, iface: InterfaceId, channel_id: usize) -> Result<(), Error> {
        let id = self.registry.lookup(iface, channel_id).ok_or_else(|| {
            let msg = format!("Unexpected transmission: {}.{}", iface.0, channel_id);
            most_error(MostError::Nxio, &msg)
        })?;

        let aim_index = self.slots.get(id).and_then(|slot| lock(slot).aim);
        if let Some(aim) = aim_index.and_then(|index| self.aims.get(index)) {
            match aim.ext.current() {
                Some(ext) => ext.tx(),
                None => aim.wake_writers(),
            }
        }

        Ok(())
    }

    pub fn open(
        self: &Arc<Self>,
        index: usize,
        access: AccessMode,
        nonblock: bool,
    ) -> Result<ChannelFile, Error> {
        if access == AccessMode::ReadWrite {
            Err(most_error(MostError::Inval, "Channel file is unidirectional"))?;
        }

        let aim = self.aim(index)?;
        let mut io = lock(&aim.io);
        if io.users > 0 {
            let msg = format!("{} is already opened", aim.name);
            Err(most_error(MostError::Busy, &msg))?;
        }
        io.users += 1;

        if aim.data_type == ChannelDataType::Isoc {
            let params = self.params();
            aim.ext.set_geometry(BlockGeometry {
                size: params.isoc_blk_sz,
                count: params.isoc_blk_num,
            });
        }

        debug!(name = %aim.name, ?access, "open");

        Ok(ChannelFile {
            mlb: self.clone(),
            index,
            access,
            nonblock,
        })
    }

    fn release(&self, index: usize) {
        if let Some(aim) = self.aims.get(index) {
            let mut io = lock(&aim.io);
            if io.binding.is_some() {
                self.stop(aim, &mut io);
            }
            io.users = io.users.saturating_sub(1);
            debug!(name = %aim.name, "release");
        }
    }

    pub(crate) fn set_address(&self, index: usize, caddr: u32) -> Result<(), Error> {
        if caddr == 0 {
            Err(most_error(MostError::Inval, "Channel address should not be zero"))?;
        }
        let tx = ((caddr >> 16) & 0xffff) as usize;
        let rx = (caddr & 0xffff) as usize;
        if tx > MLB_LAST_CHANNEL || rx > MLB_LAST_CHANNEL {
            let msg = format!("Channel address 0x{:08x} out of range", caddr);
            Err(most_error(MostError::Range, &msg))?;
        }

        let aim = self.aim(index)?;
        let mut io = lock(&aim.io);
        if io.binding.is_some() {
            let msg = format!("{} is started", aim.name);
            Err(most_error(MostError::Busy, &msg))?;
        }
        debug!(name = %aim.name, tx, rx, "channel address");
        io.caddr = caddr;

        Ok(())
    }

    fn bind<F>(
        &self,
        index: usize,
        access: AccessMode,
        data_type: ChannelDataType,
        configure: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut ChannelConfig, &[usize; FPT_TABLE_SIZE], &AimIo),
    {
        let direction = access
            .direction()
            .ok_or_else(|| most_error(MostError::Inval, "Channel is unidirectional"))?;

        let aim = self.aim(index)?;
        let mut io = lock(&aim.io);
        if io.binding.is_some() {
            let msg = format!("{} is already started", aim.name);
            Err(most_error(MostError::Busy, &msg))?;
        }

        let id = match direction {
            ChannelDirection::Tx => (io.caddr >> 16) & 0xffff,
            ChannelDirection::Rx => io.caddr & 0xffff,
        } as usize;

        let no_dev = || {
            let msg = format!("MLB channel {} is not available for {:?}", id, direction);
            most_error(MostError::NoDev, &msg)
        };

        let (iface, channel_id, cfg) = {
            let mut slot = self.slots.get(id).map(|slot| lock(slot)).ok_or_else(no_dev)?;
            let slot = &mut *slot;

            let cfg = match slot.cfg.as_mut() {
                Some(cfg) if cfg.direction == direction => cfg,
                _ => return Err(no_dev()),
            };
            if cfg.data_type != data_type {
                let msg = format!("MLB channel {} is not for {:?} data", id, data_type);
                return Err(most_error(MostError::Inval, &msg));
            }
            if slot.aim.is_some() {
                let msg = format!("MLB channel {} is used by the other channel", id);
                return Err(most_error(MostError::Busy, &msg));
            }
            let iface = slot.iface.clone().ok_or_else(no_dev)?;

            configure(cfg, &slot.fpt, &*io);
            let cfg = *cfg;
            slot.aim = Some(index);

            (iface, slot.channel_id, cfg)
        };

        aim.bind_fifo(&mut io, cfg.num_buffers);

        match iface.start_channel(channel_id, &cfg) {
            Ok(()) => {
                debug!(
                    name = %aim.name,
                    id,
                    ?direction,
                    subbuffer_size = cfg.subbuffer_size,
                    buffer_size = cfg.buffer_size,
                    packets_per_xact = cfg.packets_per_xact,
                    "started"
                );
                io.binding = Some(Binding {
                    slot: id,
                    iface,
                    channel_id,
                    cfg,
                });
                Ok(())
            }
            Err(err) => {
                debug!(name = %aim.name, id, ?err, "failed to start");
                aim.unbind_fifo(&mut io);
                lock(&self.slots[id]).aim = None;
                Err(err)
            }
        }
    }

    pub(crate) fn startup(&self, index: usize, access: AccessMode) -> Result<(), Error> {
        let mut geometry = self.block_geometry(index);
        if geometry.size == 0 || geometry.count == 0 {
            let params = self.params();
            geometry = BlockGeometry {
                size: params.isoc_blk_sz,
                count: params.isoc_blk_num,
            };
        }

        self.bind(index, access, ChannelDataType::Isoc, |cfg, fpt, _| {
            cfg.subbuffer_size = geometry.size;
            cfg.buffer_size = geometry.count * geometry.size;
            let pos = isoc_frame_size_index(geometry.size).unwrap_or(0);
            cfg.packets_per_xact = fpt[pos];
        })
    }

    pub(crate) fn sync_startup(
        &self,
        index: usize,
        access: AccessMode,
        mode: SyncStartupMode,
    ) -> Result<(), Error> {
        let bytes_per_frame = mode.bytes_per_frame();
        self.bind(index, access, ChannelDataType::Sync, |cfg, fpt, io| {
            cfg.packets_per_xact = fpt[mode.index()];
            cfg.subbuffer_size = bytes_per_frame;
            cfg.buffer_size = std::cmp::max(sync_buffer_depth(bytes_per_frame), io.sync_buf_size);
        })
    }

    pub(crate) fn shutdown(&self, index: usize) -> Result<(), Error> {
        let aim = self.aim(index)?;
        let mut io = lock(&aim.io);
        if io.binding.is_none() {
            let msg = format!("{} is not started", aim.name);
            Err(most_error(MostError::BadFd, &msg))
        } else {
            self.stop(aim, &mut io);
            Ok(())
        }
    }

    // The extension releases its buffers first, then queued ones are released before stopping.
    fn stop(&self, aim: &AimChannel, io: &mut AimIo) {
        debug!(name = %aim.name, "shut down");

        if let Some(ext) = aim.ext.current() {
            ext.cleanup();
        }

        aim.unbind_fifo(io);

        if let Some(binding) = io.binding.take() {
            if let Err(err) = binding.iface.stop_channel(binding.channel_id) {
                debug!(name = %aim.name, ?err, "failed to stop");
            }
            lock(&self.slots[binding.slot]).aim = None;
        }
    }

    fn ioctl(&self, index: usize, access: AccessMode, request: &Mlb150Request) -> Result<u32, Error> {
        debug!(?request, index, "ioctl");
        match *request {
            Mlb150Request::ChanSetAddr(caddr) => self.set_address(index, caddr).map(|_| 0),
            Mlb150Request::ChanStartup => self.startup(index, access).map(|_| 0),
            Mlb150Request::SyncChanStartup(val) => {
                let mode = SyncStartupMode::from_raw(val).ok_or_else(|| {
                    let msg = format!("Invalid startup mode: {}", val);
                    most_error(MostError::Inval, &msg)
                })?;
                self.sync_startup(index, access, mode).map(|_| 0)
            }
            Mlb150Request::ChanShutdown => self.shutdown(index).map(|_| 0),
            Mlb150Request::GetLock => Ok(MLBC0_MLBLK),
            Mlb150Request::GetIsocBufsize => {
                let geometry = self.block_geometry(index);
                Ok((geometry.size * geometry.count) as u32)
            }
            Mlb150Request::GetVersion => Ok(MLB150_VERSION),
            Mlb150Request::SetFps(_) | Mlb150Request::SetDevAddr(_) => {
                debug!("ioctl ignored");
                Ok(0)
            }
        }
    }

    /// The statistics of channel in the form of `rx_bytes tx_bytes rx_pkts tx_pkts rx_drops
    /// tx_drops`.
    pub fn stat_line(&self, index: usize) -> Result<String, Error> {
        self.aim(index).map(|aim| aim.stat_line())
    }

    pub fn stats(&self, index: usize) -> Result<ChannelStats, Error> {
        self.aim(index).map(|aim| aim.stats())
    }

    fn sync_aim(&self, index: usize) -> Result<&AimChannel, Error> {
        let aim = self.aim(index)?;
        if aim.data_type != ChannelDataType::Sync {
            let msg = format!("{} has no buffer size", aim.name);
            Err(most_error(MostError::Inval, &msg))
        } else {
            Ok(aim)
        }
    }

    pub fn sync_buffer_size_show(&self, index: usize) -> Result<String, Error> {
        let aim = self.sync_aim(index)?;
        let size = lock(&aim.io).sync_buf_size;
        Ok(format!("{}", size))
    }

    pub fn sync_buffer_size_store(&self, index: usize, text: &str) -> Result<(), Error> {
        let aim = self.sync_aim(index)?;
        let size = parse_uint(text)
            .map(|size| size as usize)
            .filter(|size| *size <= SYNC_DMA_MAX_SIZE)
            .ok_or_else(|| {
                let msg = format!("Invalid buffer size: {}", text.trim());
                most_error(MostError::Inval, &msg)
            })?;
        lock(&aim.io).sync_buf_size = size;
        Ok(())
    }

    /// Wake up any blocked reader or writer of the channel.
    pub fn interrupt(&self, index: usize) {
        if let Some(aim) = self.aims.get(index) {
            aim.interrupt_waiters();
        }
    }

    /// Register extension for the channel of the class.
    pub fn register_extension(
        self: &Arc<Self>,
        class: ExtensionClass,
        minor: usize,
        ext: Arc<dyn Extension>,
    ) -> Result<ExtensionLink, Error> {
        if class != ExtensionClass::Sync && class != ExtensionClass::Isoc {
            let msg = format!("Extension class {} is not supported", class);
            Err(most_error(MostError::Inval, &msg))?;
        }

        let index = self
            .aims
            .iter()
            .enumerate()
            .filter(|(_, aim)| aim.data_type == class.data_type())
            .nth(minor)
            .map(|(index, _)| index)
            .ok_or_else(|| {
                let msg = format!("No {} channel for minor {}", class, minor);
                most_error(MostError::NoEnt, &msg)
            })?;

        let id = self.next_ext_id.fetch_add(1, Ordering::SeqCst) + 1;
        let link = ExtensionLink {
            mlb: Arc::downgrade(self),
            index,
            id,
            class,
            minor,
        };
        ext.setup(&link)?;
        self.aims[index].ext.register(id, ext);

        debug!(%class, minor, id, "registered extension");

        Ok(link)
    }

    pub(crate) fn unregister_extension(&self, index: usize, id: u64) {
        if let Some(aim) = self.aims.get(index) {
            if let Some(ext) = aim.ext.unregister(id) {
                ext.cleanup();
            }
            debug!(name = %aim.name, id, "unregistered extension");
        }
    }

    pub(crate) fn lock_channel(&self, index: usize, id: u64, on: bool) -> Result<(), Error> {
        let aim = self.aim(index)?;
        aim.ext.lock(&aim.name, id, on)
    }

    pub(crate) fn is_locked_by(&self, index: usize, id: u64) -> bool {
        self.aims
            .get(index)
            .map(|aim| aim.ext.is_holder(id))
            .unwrap_or(false)
    }

    pub(crate) fn extension_tx_mbo(&self, index: usize, id: u64) -> Result<Mbo, Error> {
        let aim = self.aim(index)?;
        if !aim.ext.is_holder(id) {
            let msg = format!("{} is not locked by extension {}", aim.name, id);
            Err(most_error(MostError::Busy, &msg))?;
        }

        let io = lock(&aim.io);
        let binding = io.binding.as_ref().ok_or_else(|| {
            let msg = format!("{} is not started", aim.name);
            most_error(MostError::Shutdown, &msg)
        })?;

        binding.iface.get_mbo(binding.channel_id).ok_or_else(|| {
            let msg = format!("No buffer available in {}", aim.name);
            most_error(MostError::Again, &msg)
        })
    }

    pub(crate) fn block_geometry(&self, index: usize) -> BlockGeometry {
        self.aims
            .get(index)
            .map(|aim| aim.ext.geometry())
            .unwrap_or_default()
    }

    pub(crate) fn bound_config(&self, index: usize) -> Option<ChannelConfig> {
        self.aims.get(index).and_then(|aim| {
            lock(&aim.io)
                .binding
                .as_ref()
                .map(|binding| binding.cfg)
        })
    }
}

/// The handle of opened channel. The channel is shut down when dropped.
pub struct ChannelFile {
    mlb: Arc<Mlb150>,
    index: usize,
    access: AccessMode,
    nonblock: bool,
}

impl std::fmt::Debug for ChannelFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChannelFile")
            .field("index", &self.index)
            .field("access", &self.access)
            .field("nonblock", &self.nonblock)
            .finish()
    }
}

impl ChannelFile {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn set_nonblocking(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn aim(&self) -> &AimChannel {
        // The index was validated at open.
        &self.mlb.aims[self.index]
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.aim().read(buf, self.nonblock)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.aim().write(buf, self.nonblock)
    }

    pub fn poll(&self) -> PollFlags {
        self.aim().poll()
    }

    pub fn ioctl(&self, request: &Mlb150Request) -> Result<u32, Error> {
        self.mlb.ioctl(self.index, self.access, request)
    }

    /// Wake up blocked reader or writer with `MostError::Restart`.
    pub fn interrupt(&self) {
        self.aim().interrupt_waiters();
    }
}

impl Drop for ChannelFile {
    fn drop(&mut self) {
        self.mlb.release(self.index);
    }
}

#[cfg(test)]
mod test {
    use {
        super::{super::mbo::loopback::*, *},
        std::{
            sync::mpsc,
            thread,
            time::Duration,
        },
    };

    const RX_CH: usize = 0;
    const TX_CH: usize = 1;
    const ISOC_CH: usize = 2;

    fn sync_config(direction: ChannelDirection) -> ChannelConfig {
        ChannelConfig {
            direction,
            data_type: ChannelDataType::Sync,
            num_buffers: 4,
            buffer_size: 64,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<Mlb150>, Arc<LoopbackInterface>) {
        let mlb = Mlb150::new(Default::default()).unwrap();
        let iface = LoopbackInterface::new(0x1234_5678_9abc_def0);
        iface.add_channel(RX_CH, 8, 64);
        iface.add_channel(TX_CH, 2, 64);
        iface.add_channel(ISOC_CH, 2, 1504);

        mlb.probe_channel(iface.clone(), RX_CH, sync_config(ChannelDirection::Rx), "9")
            .unwrap();
        mlb.probe_channel(
            iface.clone(),
            TX_CH,
            sync_config(ChannelDirection::Tx),
            "10/2x16,100 2x24,zz",
        )
        .unwrap();
        let cfg = ChannelConfig {
            direction: ChannelDirection::Rx,
            data_type: ChannelDataType::Isoc,
            num_buffers: 2,
            buffer_size: 1504,
            ..Default::default()
        };
        mlb.probe_channel(iface.clone(), ISOC_CH, cfg, "11/192,7").unwrap();

        (mlb, iface)
    }

    fn start_rx(mlb: &Arc<Mlb150>) -> ChannelFile {
        let file = mlb.open(0, AccessMode::ReadOnly, false).unwrap();
        file.ioctl(&Mlb150Request::ChanSetAddr((10 << 16) | 9)).unwrap();
        file.ioctl(&Mlb150Request::SyncChanStartup(SyncStartupMode::StereoRx.index() as u32))
            .unwrap();
        file
    }

    fn deliver(mlb: &Mlb150, iface: &LoopbackInterface, payload: &[u8]) {
        let mbo = iface.rx_buffer(RX_CH, payload).unwrap();
        mlb.rx_completion(mbo).unwrap();
    }

    #[test]
    fn channel_names() {
        let mlb = Mlb150::new(Default::default()).unwrap();
        assert_eq!(mlb.channel_count(), 8);
        assert_eq!(mlb.channel_name(0), Some("sync0"));
        assert_eq!(mlb.channel_name(7), Some("isoc"));
        assert_eq!(mlb.find_channel("sync6"), Some(6));

        let params = Mlb150Params {
            sync_channels: 2,
            isoc_channels: 2,
            ..Default::default()
        };
        let mlb = Mlb150::new(params).unwrap();
        assert_eq!(mlb.channel_name(2), Some("isoc0"));
        assert_eq!(mlb.channel_name(3), Some("isoc1"));

        let params = Mlb150Params {
            isoc_channels: 5,
            ..Default::default()
        };
        assert!(Mlb150::new(params).is_err());
    }

    #[test]
    fn probe_channel_validation() {
        let mlb = Mlb150::new(Default::default()).unwrap();
        let iface = LoopbackInterface::new(1);
        let cfg = sync_config(ChannelDirection::Rx);

        let err = mlb.probe_channel(iface.clone(), 0, cfg, "64").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Nxio));
        let err = mlb.probe_channel(iface.clone(), 0, cfg, "0").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Nxio));
        let err = mlb.probe_channel(iface.clone(), 0, cfg, "/1x16,1").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));

        let ctrl = ChannelConfig {
            data_type: ChannelDataType::Control,
            ..cfg
        };
        let err = mlb.probe_channel(iface.clone(), 0, ctrl, "5").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));

        mlb.probe_channel(iface.clone(), 0, cfg, "0x5").unwrap();
        let err = mlb.probe_channel(iface.clone(), 1, cfg, "5").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));
        let err = mlb.probe_channel(iface.clone(), 0, cfg, "6").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));
    }

    #[test]
    fn channel_params_parsing() {
        let cfg = sync_config(ChannelDirection::Tx);
        let mut table = default_fpt_table(cfg.data_type);
        assert_eq!(table[SyncStartupMode::StereoTx.index()], 128);
        assert_eq!(table[SyncStartupMode::Surround51HqTx.index()], 28);

        parse_channel_params(&mut table, &cfg, "2x16,100 6X24,0x10 2x24,zz 1x16,5");
        assert_eq!(table[SyncStartupMode::StereoTx.index()], 100);
        assert_eq!(table[SyncStartupMode::Surround51HqTx.index()], 16);
        assert_eq!(table[SyncStartupMode::StereoHqTx.index()], 85);
        assert_eq!(table[SyncStartupMode::MonoTx.index()], 5);

        let mut table = default_fpt_table(cfg.data_type);
        parse_channel_params(&mut table, &cfg, "4x16,1 2x16,1");
        assert_eq!(table, default_fpt_table(cfg.data_type));

        let cfg = ChannelConfig {
            data_type: ChannelDataType::Isoc,
            ..cfg
        };
        let mut table = default_fpt_table(cfg.data_type);
        assert_eq!(&table[..4], &[2, 2, 2, 2]);
        parse_channel_params(&mut table, &cfg, "196,9\t206,3");
        assert_eq!(&table[..4], &[2, 2, 9, 3]);
    }

    #[test]
    fn fifo_ordering_with_partial_reads() {
        let (mlb, iface) = setup();
        let file = start_rx(&mlb);

        let payloads: [&[u8]; 3] = [&[1, 2, 3, 4, 5], &[6, 7, 8], &[9, 10, 11, 12, 13, 14, 15]];
        payloads.iter().for_each(|p| deliver(&mlb, &iface, p));
        assert!(file.poll().contains(PollFlags::POLLIN));

        let mut received = Vec::new();
        let mut buf = [0; 4];
        while received.len() < 15 {
            let len = file.read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..len]);
        }
        assert_eq!(received, (1..=15).collect::<Vec<u8>>());
        assert!(file.poll().is_empty());

        let stats = mlb.stats(0).unwrap();
        assert_eq!(stats.rx_bytes, 15);
        assert_eq!(stats.rx_pkts, 3);
        assert_eq!(iface.outstanding(RX_CH), 0);
        assert_eq!(mlb.stat_line(0).unwrap(), "15 0 3 0 0 0\n");
    }

    #[test]
    fn fifo_overflow_drops() {
        let (mlb, iface) = setup();
        let mut file = start_rx(&mlb);

        (0..5).for_each(|i| deliver(&mlb, &iface, &[i; 2]));
        assert_eq!(iface.outstanding(RX_CH), 4);
        assert_eq!(mlb.stats(0).unwrap().rx_drops, 1);

        file.set_nonblocking(true);
        let mut buf = [0; 8];
        (0..4).for_each(|i| {
            assert_eq!(file.read(&mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], &[i, i]);
        });
        let err = file.read(&mut buf).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Again));
    }

    #[test]
    fn write_and_teardown() {
        let (mlb, iface) = setup();
        let file = mlb.open(1, AccessMode::WriteOnly, true).unwrap();
        file.ioctl(&Mlb150Request::ChanSetAddr((10 << 16) | 9)).unwrap();
        file.ioctl(&Mlb150Request::SyncChanStartup(SyncStartupMode::StereoTx.index() as u32))
            .unwrap();

        let cfg = iface.started_config(TX_CH).unwrap();
        assert_eq!(cfg.packets_per_xact, 100);
        assert_eq!(cfg.subbuffer_size, 4);
        assert_eq!(cfg.buffer_size, 512);
        assert!(file.poll().contains(PollFlags::POLLOUT));

        let data: Vec<u8> = (0..100).collect();
        assert_eq!(file.write(&data).unwrap(), 64);
        assert_eq!(file.write(&data[64..]).unwrap(), 36);
        assert_eq!(file.write(&[]).unwrap(), 0);

        let mut submitted = iface.take_submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].data(), &data[..64]);

        // The other buffer is cached with partial data.
        assert_eq!(iface.available(TX_CH), 0);
        assert_eq!(file.write(&[0; 64]).unwrap(), 28);
        let err = file.write(&[0; 8]).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Again));
        assert!(file.poll().is_empty());

        submitted.append(&mut iface.take_submitted());
        assert_eq!(submitted.len(), 2);
        submitted.into_iter().for_each(|mbo| mbo.put());
        mlb.tx_completion(iface.id(), TX_CH).unwrap();
        assert!(file.poll().contains(PollFlags::POLLOUT));
        assert_eq!(file.write(&[0; 8]).unwrap(), 8);

        file.ioctl(&Mlb150Request::ChanShutdown).unwrap();
        let stats = mlb.stats(1).unwrap();
        assert_eq!(stats.tx_pkts, 2);
        assert_eq!(stats.tx_bytes, 128);
        assert_eq!(stats.tx_drops, 1);
        assert_eq!(iface.outstanding(TX_CH), 0);
        assert!(!iface.is_started(TX_CH));
    }

    #[test]
    fn address_and_startup_errors() {
        let (mlb, _iface) = setup();

        let err = mlb.open(0, AccessMode::ReadWrite, false).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));

        let file = mlb.open(0, AccessMode::ReadOnly, false).unwrap();
        let err = mlb.open(0, AccessMode::ReadOnly, false).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        let err = file.ioctl(&Mlb150Request::ChanSetAddr(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));
        let err = file.ioctl(&Mlb150Request::ChanSetAddr(64 << 16 | 9)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Range));
        let err = file.ioctl(&Mlb150Request::ChanSetAddr(64)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Range));

        let err = file.ioctl(&Mlb150Request::ChanShutdown).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::BadFd));

        // No slot for the receive half.
        file.ioctl(&Mlb150Request::ChanSetAddr((9 << 16) | 12)).unwrap();
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NoDev));

        // The receive half is for transmission.
        file.ioctl(&Mlb150Request::ChanSetAddr(10)).unwrap();
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NoDev));

        // The slot is for isochronous data.
        file.ioctl(&Mlb150Request::ChanSetAddr(11)).unwrap();
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(10)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));

        file.ioctl(&Mlb150Request::ChanSetAddr(9)).unwrap();
        file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap();
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));
        let err = file.ioctl(&Mlb150Request::ChanSetAddr(9)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        // The slot is already bound to the first channel.
        let other = mlb.open(2, AccessMode::ReadOnly, false).unwrap();
        other.ioctl(&Mlb150Request::ChanSetAddr(9)).unwrap();
        let err = other.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        assert_eq!(file.ioctl(&Mlb150Request::GetLock).unwrap(), 0x80);
        assert_eq!(file.ioctl(&Mlb150Request::GetVersion).unwrap(), 0x03030083);
        assert_eq!(file.ioctl(&Mlb150Request::SetFps(512)).unwrap(), 0);
        assert_eq!(file.ioctl(&Mlb150Request::SetDevAddr(1)).unwrap(), 0);

        drop(file);
        let file = mlb.open(0, AccessMode::ReadOnly, false).unwrap();
        let err = file.ioctl(&Mlb150Request::ChanShutdown).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::BadFd));
    }

    #[test]
    fn isoc_startup_with_geometry() {
        let (mlb, iface) = setup();
        mlb.isoc_blk_sz_store("192\n").unwrap();
        assert_eq!(mlb.isoc_blk_sz_show(), "192\n");
        assert!(mlb.isoc_blk_sz_store("187").is_err());
        assert!(mlb.isoc_blk_num_store("2").is_err());
        assert_eq!(mlb.isoc_blk_num_show(), "8\n");

        let file = mlb.open(7, AccessMode::ReadOnly, false).unwrap();
        // The geometry is captured at open.
        mlb.isoc_blk_sz_store("188").unwrap();
        assert_eq!(file.ioctl(&Mlb150Request::GetIsocBufsize).unwrap(), 192 * 8);

        file.ioctl(&Mlb150Request::ChanSetAddr(11)).unwrap();
        let err = file.ioctl(&Mlb150Request::SyncChanStartup(0)).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));
        file.ioctl(&Mlb150Request::ChanStartup).unwrap();

        let cfg = iface.started_config(ISOC_CH).unwrap();
        assert_eq!(cfg.subbuffer_size, 192);
        assert_eq!(cfg.buffer_size, 192 * 8);
        assert_eq!(cfg.packets_per_xact, 7);
    }

    #[test]
    fn sync_buffer_size_attribute() {
        let (mlb, iface) = setup();
        assert_eq!(mlb.sync_buffer_size_show(0).unwrap(), "256");
        mlb.sync_buffer_size_store(0, "0x400\n").unwrap();
        assert_eq!(mlb.sync_buffer_size_show(0).unwrap(), "1024");
        assert!(mlb.sync_buffer_size_store(0, "0x2001").is_err());
        assert!(mlb.sync_buffer_size_show(7).is_err());

        let _file = start_rx(&mlb);
        let cfg = iface.started_config(RX_CH).unwrap();
        assert_eq!(cfg.buffer_size, 1024);
        assert_eq!(cfg.subbuffer_size, 4);
        assert_eq!(cfg.packets_per_xact, 128);
    }

    #[test]
    fn shutdown_wakes_blocked_reader() {
        let (mlb, iface) = setup();
        let file = Arc::new(start_rx(&mlb));

        let reader = file.clone();
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let mut buf = [0; 8];
            let res = reader.read(&mut buf);
            tx.send(res.map_err(|e| e.kind::<MostError>())).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        deliver(&mlb, &iface, &[1, 2, 3]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(3));
        th.join().unwrap();

        let reader = file.clone();
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let mut buf = [0; 8];
            let res = reader.read(&mut buf);
            tx.send(res.map_err(|e| e.kind::<MostError>())).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        file.ioctl(&Mlb150Request::ChanShutdown).unwrap();
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(res, Err(Some(MostError::Shutdown)));
        th.join().unwrap();

        assert_eq!(iface.outstanding(RX_CH), 0);
        assert!(!iface.is_started(RX_CH));
    }

    #[test]
    fn interrupt_wakes_blocked_reader() {
        let (mlb, _iface) = setup();
        let file = Arc::new(start_rx(&mlb));

        let reader = file.clone();
        let (tx, rx) = mpsc::channel();
        let th = thread::spawn(move || {
            let mut buf = [0; 8];
            let res = reader.read(&mut buf);
            tx.send(res.map_err(|e| e.kind::<MostError>())).unwrap();
        });

        let res = loop {
            file.interrupt();
            if let Ok(res) = rx.recv_timeout(Duration::from_millis(20)) {
                break res;
            }
        };
        assert_eq!(res, Err(Some(MostError::Restart)));
        th.join().unwrap();
    }

    #[test]
    fn disconnect_tears_down() {
        let (mlb, iface) = setup();
        let file = Arc::new(start_rx(&mlb));
        deliver(&mlb, &iface, &[1, 2, 3]);
        assert_eq!(iface.outstanding(RX_CH), 1);

        mlb.disconnect_channel(iface.id(), RX_CH).unwrap();
        assert_eq!(iface.outstanding(RX_CH), 0);

        let mut buf = [0; 4];
        let err = file.read(&mut buf).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Shutdown));

        let err = mlb.disconnect_channel(iface.id(), RX_CH).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Nxio));

        let mbo = iface.rx_buffer(RX_CH, &[0]).unwrap();
        let err = mlb.rx_completion(mbo).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Nxio));
        assert_eq!(iface.outstanding(RX_CH), 0);

        // The slot is available again.
        mlb.probe_channel(iface.clone(), RX_CH, sync_config(ChannelDirection::Rx), "9")
            .unwrap();
    }

    #[derive(Default)]
    struct Collector {
        received: Mutex<Vec<Mbo>>,
        tx_count: Mutex<usize>,
        cleanups: Mutex<usize>,
    }

    impl Extension for Collector {
        fn rx(&self, mbo: Mbo) {
            lock(&self.received).push(mbo);
        }

        fn tx(&self) {
            *lock(&self.tx_count) += 1;
        }

        fn cleanup(&self) {
            *lock(&self.cleanups) += 1;
            lock(&self.received).drain(..).for_each(|mbo| mbo.put());
        }
    }

    #[test]
    fn exclusive_lock_routes_completions() {
        let (mlb, iface) = setup();
        let file = start_rx(&mlb);

        let first = Arc::new(Collector::default());
        let second = Arc::new(Collector::default());
        let link_a = mlb
            .register_extension(ExtensionClass::Sync, 0, first.clone())
            .unwrap();
        let link_b = mlb
            .register_extension(ExtensionClass::Sync, 0, second.clone())
            .unwrap();

        link_a.lock(true).unwrap();
        let err = link_b.lock(true).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));
        assert!(link_a.is_locked());
        assert!(!link_b.is_locked());

        deliver(&mlb, &iface, &[1]);
        deliver(&mlb, &iface, &[2]);
        assert_eq!(lock(&first.received).len(), 2);
        assert_eq!(lock(&second.received).len(), 0);

        let mut buf = [0; 4];
        let err = file.read(&mut buf).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Users));
        assert!(file.poll().is_empty());

        mlb.tx_completion(iface.id(), RX_CH).unwrap();
        assert_eq!(*lock(&first.tx_count), 1);

        let err = link_b.get_tx_mbo().unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        link_a.lock(false).unwrap();
        link_b.lock(true).unwrap();
        deliver(&mlb, &iface, &[3]);
        assert_eq!(lock(&second.received).len(), 1);

        // Releasing buffers held by the extensions.
        file.ioctl(&Mlb150Request::ChanShutdown).unwrap();
        assert_eq!(*lock(&second.cleanups), 1);
        assert_eq!(*lock(&first.cleanups), 0);
        lock(&first.received).drain(..).for_each(|mbo| mbo.put());
        assert_eq!(iface.outstanding(RX_CH), 0);

        let err = link_b.get_tx_mbo().unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Shutdown));

        link_b.unregister();
        assert!(!link_b.is_locked());
        let err = link_b.lock(true).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));
    }

    #[test]
    fn extension_registration() {
        let (mlb, _iface) = setup();
        let ext = Arc::new(Collector::default());

        let err = mlb
            .register_extension(ExtensionClass::Sync, 7, ext.clone())
            .unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NoEnt));
        let err = mlb
            .register_extension(ExtensionClass::Isoc, 1, ext.clone())
            .unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NoEnt));
        let err = mlb
            .register_extension(ExtensionClass::Control, 0, ext.clone())
            .unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));

        let link = mlb
            .register_extension(ExtensionClass::Isoc, 0, ext.clone())
            .unwrap();
        assert_eq!(link.name(), "isoc");
        assert_eq!(link.class(), ExtensionClass::Isoc);
        assert_eq!(link.minor(), 0);

        let _file = mlb.open(7, AccessMode::ReadOnly, false).unwrap();
        assert_eq!(
            link.geometry(),
            BlockGeometry {
                size: 188,
                count: 8
            }
        );
    }

    #[test]
    fn buffer_conservation() {
        let (mlb, iface) = setup();
        let file = start_rx(&mlb);
        let ext = Arc::new(Collector::default());
        let link = mlb
            .register_extension(ExtensionClass::Sync, 0, ext.clone())
            .unwrap();

        let mut buf = [0; 3];
        (0..40u8).for_each(|i| {
            match i % 5 {
                0 => link.lock(true).unwrap(),
                3 => link.lock(false).unwrap(),
                _ => (),
            }
            if let Some(mbo) = iface.rx_buffer(RX_CH, &[i; 4]) {
                mlb.rx_completion(mbo).unwrap();
            }
            if i % 2 == 0 {
                let _ = file.read(&mut buf);
            }
            if i % 7 == 0 {
                lock(&ext.received).drain(..).for_each(|mbo| mbo.put());
            }
            let held = lock(&ext.received).len() + mlb.aims[0].queued();
            assert_eq!(iface.outstanding(RX_CH), held);
        });

        link.lock(true).unwrap();
        drop(file);
        assert_eq!(iface.outstanding(RX_CH), 0);
        assert_eq!(iface.available(RX_CH), 8);
    }
}
