// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Hardware dependent module for network interface controller connected by SPI bus.
//!
//! The module includes the device which multiplexes four logical channels and Driver Control
//! Interface (DCI) over SPI bus. The transactions are serialized by the bus. The interrupt from
//! the controller is serviced by a worker thread; the request of service is coalesced while the
//! previous one is pending.

pub mod channel;
pub mod dci;
pub mod framing;

use {
    super::{mbo::*, *},
    channel::*,
    dci::*,
    framing::*,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Weak,
        },
        thread,
    },
    tracing::{debug, error, warn},
};

/// No interrupt delay. Threshold is 64 bytes for control and 1536 bytes for asynchronous
/// transmission.
pub const DR_CONFIG: u32 = (5 << 28) | (9 << 24);

const NOTIFY_EUI48_VAL: u16 = 1 << 2;
const SET_CFG_VAL: u16 = (1 << 0) | (1 << 1) | (1 << 2);

const NET_PARAMS: [u16; 5] = [
    0x145,
    0x146,
    0x147,
    dci_reg_onoff_state(ATX_DCI_CH_IDX),
    dci_reg_onoff_state(ARX_DCI_CH_IDX),
];

const NTF_CLEAR: [u16; 3] = [
    0x3000,
    dci_reg_events(ATX_DCI_CH_IDX),
    dci_reg_events(ARX_DCI_CH_IDX),
];

const NTF_CLEAR_VAL: [u16; 3] = [
    // EUI48.
    1 << 2,
    // Sync needed and route state changed.
    (1 << 0) | (1 << 1),
    (1 << 0) | (1 << 1),
];

/// The transport of SPI transaction.
pub trait SpiTransport: Send {
    /// Transfer the bytes in a transaction. When given, the bytes received at the same time are
    /// stored to the buffer with the same length.
    fn transfer(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<(), Error>;
}

/// The bus to serialize transactions.
pub struct SpiBus(Mutex<Box<dyn SpiTransport>>);

impl SpiBus {
    pub fn new(transport: Box<dyn SpiTransport>) -> Self {
        Self(Mutex::new(transport))
    }

    pub fn write(&self, frame: &[u8]) -> Result<(), Error> {
        lock(&self.0).transfer(frame, None).map_err(|err| {
            warn!(opcode = frame.first().copied().unwrap_or(0), ?err, "spi transfer failed");
            err
        })
    }

    /// Transfer the bytes, then store the received bytes to the same buffer.
    pub fn exchange(&self, frame: &mut [u8]) -> Result<(), Error> {
        let tx = frame.to_vec();
        lock(&self.0).transfer(&tx, Some(frame)).map_err(|err| {
            warn!(opcode = tx.first().copied().unwrap_or(0), ?err, "spi exchange failed");
            err
        })
    }

    pub fn write_reg(&self, reg: u8, val: u32) -> Result<(), Error> {
        self.write(&encode_reg_write(reg, val))
    }

    pub fn read_reg(&self, reg: u8) -> Result<u32, Error> {
        let mut frame = encode_reg_read(reg);
        self.exchange(&mut frame)?;
        Ok(decode_reg_value(&frame))
    }
}

/// The bookkeeping of interrupt mask. The mask desired by channels is written to hardware only
/// when it differs from the last written one.
#[derive(Default, Debug)]
pub struct InterruptMask {
    spi_mask: u32,
    aim_mask: u32,
}

impl InterruptMask {
    pub fn is_enabled(&self, bit: u32) -> bool {
        self.aim_mask & (1 << bit) == 0
    }

    pub fn enable(&mut self, bit: u32) {
        self.aim_mask &= !(1 << bit);
    }

    pub fn disable(&mut self, bit: u32) {
        self.aim_mask |= 1 << bit;
    }

    pub fn set_enabled(&mut self, bit: u32, enable: bool) {
        if enable {
            self.enable(bit);
        } else {
            self.disable(bit);
        }
    }

    pub fn mask_all(&mut self) {
        self.aim_mask = GINT_CHSTS_INTM;
    }

    pub fn aim_mask(&self) -> u32 {
        self.aim_mask
    }

    fn write(&mut self, bus: &SpiBus, error_mask: u32) -> Result<(), Error> {
        self.spi_mask = self.aim_mask;
        bus.write_reg(GINT_CHSTS_ADDR, self.aim_mask | error_mask)
    }

    fn flush(&mut self, bus: &SpiBus) -> Result<(), Error> {
        if self.spi_mask != self.aim_mask {
            self.write(bus, 0)
        } else {
            Ok(())
        }
    }
}

/// The information of network.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetInfo {
    pub link_up: bool,
    pub mac: [u8; 6],
}

impl NetInfo {
    fn parse(vals: &[u16]) -> Option<Self> {
        if vals.len() < NET_PARAMS.len() {
            None
        } else {
            let mut mac = [0; 6];
            vals[..3]
                .iter()
                .zip(mac.chunks_exact_mut(2))
                .for_each(|(val, octets)| octets.copy_from_slice(&val.to_be_bytes()));
            Some(Self {
                link_up: vals[3] == 1 && vals[4] == 1,
                mac,
            })
        }
    }
}

pub type NetInfoCallback = Box<dyn Fn(&NetInfo) + Send + Sync>;

/// Called when the buffer object is completed by the channel.
pub type MboCompletion = Arc<dyn Fn(Mbo) + Send + Sync>;

struct ChannelEntry {
    ch: HdmChannel,
    completion: Option<MboCompletion>,
}

fn deliver(completion: Option<MboCompletion>, mbos: Vec<Mbo>) {
    match completion {
        Some(cb) => mbos.into_iter().for_each(|mbo| cb(mbo)),
        None => mbos.into_iter().for_each(|mbo| mbo.put()),
    }
}

/// The device of network interface controller. The lock of channel is acquired before the lock
/// of interrupt mask. The lock of bus is the last.
pub struct HdmDevice {
    me: Weak<HdmDevice>,
    bus: SpiBus,
    channels: Vec<Mutex<ChannelEntry>>,
    gint: Mutex<InterruptMask>,
    dci: Mutex<DciQueue>,
    netinfo: Mutex<Option<NetInfoCallback>>,
}

impl HdmDevice {
    pub const DESCRIPTION: &'static str = "spi";

    /// Initialize the controller; all channel interrupts are masked, errors are enabled, and DCI
    /// waits for notification.
    pub fn probe(transport: Box<dyn SpiTransport>) -> Result<Arc<Self>, Error> {
        let dev = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus: SpiBus::new(transport),
            channels: CHANNEL_CLASSES
                .iter()
                .map(|class| {
                    Mutex::new(ChannelEntry {
                        ch: HdmChannel::new(class),
                        completion: None,
                    })
                })
                .collect(),
            gint: Default::default(),
            dci: Default::default(),
            netinfo: Default::default(),
        });

        {
            let mut gint = lock(&dev.gint);
            gint.mask_all();
            gint.write(&dev.bus, GINT_CHSTS_ERRM)?;
        }

        dev.bus.write_reg(DR_CONFIG_ADDR, DR_CONFIG)?;

        lock(&dev.dci).init(&dev.bus)?;

        {
            let mut gint = lock(&dev.gint);
            gint.enable(GINT_CHSTS_DCITSM_B);
            gint.flush(&dev.bus)?;
        }

        debug!(description = Self::DESCRIPTION, "probed");

        Ok(dev)
    }

    /// Mask all interrupts. Queued DCI jobs are discarded.
    pub fn remove(&self) -> Result<(), Error> {
        *lock(&self.netinfo) = None;
        let discarded = lock(&self.dci).clear();
        if discarded > 0 {
            debug!(discarded, "dci jobs discarded");
        }

        let mut gint = lock(&self.gint);
        gint.mask_all();
        gint.flush(&self.bus)?;

        debug!("removed");

        Ok(())
    }

    pub fn channel_class(idx: usize) -> Option<&'static ChannelClass> {
        CHANNEL_CLASSES.get(idx)
    }

    pub fn channel_state(&self, idx: usize) -> Option<ChannelState> {
        self.channels.get(idx).map(|entry| lock(entry).ch.state())
    }

    pub fn interrupt_mask(&self) -> u32 {
        lock(&self.gint).aim_mask()
    }

    pub fn dci_mode(&self) -> ServiceMode {
        lock(&self.dci).mode()
    }

    pub fn dci_queued(&self) -> usize {
        lock(&self.dci).len()
    }

    fn entry(&self, idx: usize) -> Result<&Mutex<ChannelEntry>, Error> {
        self.channels.get(idx).ok_or_else(|| {
            let msg = format!("Bad channel index: {}", idx);
            most_error(MostError::Inval, &msg)
        })
    }

    /// Configure the channel. The completion is called for every buffer object completed by the
    /// channel, without any lock of the device.
    pub fn configure_channel(
        &self,
        idx: usize,
        cfg: &ChannelConfig,
        completion: MboCompletion,
    ) -> Result<(), Error> {
        let entry = self.entry(idx)?;
        let class = &CHANNEL_CLASSES[idx];

        if cfg.data_type != class.data_type {
            error!(name = class.name, data_type = ?cfg.data_type, "wrong data type");
            let msg = format!("{}: wrong data type", class.name);
            Err(most_error(MostError::Inval, &msg))?;
        }

        if cfg.direction != class.direction {
            error!(name = class.name, direction = ?cfg.direction, "wrong direction");
            let msg = format!("{}: wrong direction", class.name);
            Err(most_error(MostError::Inval, &msg))?;
        }

        {
            let mut entry = lock(entry);
            entry.ch.init();
            entry.completion = Some(completion);
        }

        {
            let mut gint = lock(&self.gint);
            gint.set_enabled(class.int_mask_bit, class.direction == ChannelDirection::Rx);
            gint.flush(&self.bus)?;
        }

        let cfg_reg = match idx {
            CH_ASYNC_TX => Some(dci_reg_config(ATX_DCI_CH_IDX)),
            CH_ASYNC_RX => Some(dci_reg_config(ARX_DCI_CH_IDX)),
            _ => None,
        };
        if let Some(reg) = cfg_reg {
            lock(&self.dci).enqueue(&self.bus, DciCommand::Write, &[reg], &[SET_CFG_VAL], None)?;
        }

        debug!(name = class.name, "configured");

        Ok(())
    }

    /// Queue the buffer object to the channel.
    pub fn enqueue(&self, idx: usize, mbo: Mbo) -> Result<(), Error> {
        let entry = match self.entry(idx) {
            Ok(entry) => entry,
            Err(err) => {
                mbo.put();
                return Err(err);
            }
        };

        let (completed, completion) = {
            let mut entry = lock(entry);
            if !entry.ch.is_configured() {
                let name = entry.ch.class().name;
                drop(entry);
                mbo.put();
                let msg = format!("{} is not configured", name);
                return Err(most_error(MostError::NotConn, &msg));
            }

            entry.ch.push(mbo);
            let mut completed = Vec::new();
            let enable = entry.ch.xfer(&self.bus, &mut completed);
            {
                let mut gint = lock(&self.gint);
                gint.set_enabled(entry.ch.class().int_mask_bit, enable);
                if let Err(err) = gint.flush(&self.bus) {
                    debug!(?err, "failed to flush interrupt mask");
                }
            }
            (completed, entry.completion.clone())
        };

        deliver(completion, completed);

        Ok(())
    }

    /// Detach the channel. Waiting buffer objects are completed with closed status.
    pub fn poison_channel(&self, idx: usize) -> Result<(), Error> {
        let entry = self.entry(idx)?;

        let cfg_reg = match idx {
            CH_ASYNC_TX => Some(dci_reg_config(ATX_DCI_CH_IDX)),
            CH_ASYNC_RX => Some(dci_reg_config(ARX_DCI_CH_IDX)),
            _ => None,
        };
        if let Some(reg) = cfg_reg {
            let mut dci = lock(&self.dci);
            dci.enqueue(&self.bus, DciCommand::Write, &[DCI_REG_NOTIFY], &[0], None)?;
            dci.enqueue(&self.bus, DciCommand::Write, &[reg], &[0], None)?;
        }

        let (mbos, completion) = {
            let mut entry = lock(entry);
            {
                let mut gint = lock(&self.gint);
                gint.disable(entry.ch.class().int_mask_bit);
                if let Err(err) = gint.flush(&self.bus) {
                    debug!(?err, "failed to flush interrupt mask");
                }
            }
            let mbos = entry.ch.poison();
            (mbos, entry.completion.take())
        };

        debug!(idx, count = mbos.len(), "poisoned");
        deliver(completion, mbos);

        Ok(())
    }

    /// Set or clear the callback for network information. When set, the information is requested
    /// immediately.
    pub fn request_netinfo(&self, callback: Option<NetInfoCallback>) -> Result<(), Error> {
        let enable = callback.is_some();
        *lock(&self.netinfo) = callback;
        if !enable {
            return Ok(());
        }

        let mut dci = lock(&self.dci);
        dci.enqueue(
            &self.bus,
            DciCommand::Write,
            &[DCI_REG_NOTIFY],
            &[NOTIFY_EUI48_VAL],
            None,
        )?;
        dci.enqueue(
            &self.bus,
            DciCommand::Read,
            &NET_PARAMS,
            &[0; NET_PARAMS.len()],
            Some(self.netinfo_completion()),
        )
    }

    fn netinfo_completion(&self) -> DciCompletion {
        let me = self.me.clone();
        Box::new(move |res| match (me.upgrade(), res) {
            (Some(dev), Ok(vals)) => dev.report_netinfo(&vals),
            (_, Err(err)) => debug!(?err, "failed to read network parameters"),
            _ => (),
        })
    }

    fn report_netinfo(&self, vals: &[u16]) {
        if let Some(info) = NetInfo::parse(vals) {
            debug!(link_up = info.link_up, mac = ?info.mac, "network info");
            if let Some(cb) = lock(&self.netinfo).as_ref() {
                cb(&info);
            }
        }
    }

    /// Service the interrupt from the controller.
    pub fn service_interrupt(&self) -> Result<(), Error> {
        let status = self.bus.read_reg(GINT_CHSTS_ADDR)?;
        lock(&self.gint).spi_mask = status & GINT_CHSTS_INTM;

        if status & (1 << GINT_CHSTS_DCITS_B) > 0 {
            let dci_ctrl = self.bus.read_reg(DCI_CTRL_ADDR)?;
            let events = {
                let mut dci = lock(&self.dci);
                let events = dci.service(&self.bus, dci_ctrl);
                if events.notified {
                    let res = dci
                        .enqueue(
                            &self.bus,
                            DciCommand::Write,
                            &NTF_CLEAR,
                            &NTF_CLEAR_VAL,
                            None,
                        )
                        .and_then(|_| {
                            dci.enqueue(
                                &self.bus,
                                DciCommand::Read,
                                &NET_PARAMS,
                                &[0; NET_PARAMS.len()],
                                Some(self.netinfo_completion()),
                            )
                        });
                    if let Err(err) = res {
                        warn!(?err, "failed to handle notification");
                    }
                }
                events
            };
            events.complete();
        }

        if status & (1 << GINT_CHSTS_SPI_ERR_B) > 0 {
            warn!("SPI protocol error");
        }
        if status & (1 << GINT_CHSTS_DCI_ERR_B) > 0 {
            warn!("DCI error");
        }

        CHANNEL_CLASSES
            .iter()
            .zip(&self.channels)
            .for_each(|(class, entry)| {
                if status & (1 << class.err_status_bit) > 0 {
                    warn!(name = class.name, "channel state error");
                }

                if status & (1 << class.int_status_bit) == 0 {
                    return;
                }

                let (completed, completion) = {
                    let mut entry = lock(entry);
                    if !entry.ch.is_configured() {
                        return;
                    }
                    if entry.ch.update_buf_size(&self.bus).is_err() {
                        return;
                    }
                    let mut completed = Vec::new();
                    let enable = entry.ch.xfer(&self.bus, &mut completed);
                    lock(&self.gint).set_enabled(class.int_mask_bit, enable);
                    (completed, entry.completion.clone())
                };

                deliver(completion, completed);
            });

        let mut gint = lock(&self.gint);
        if status & GINT_CHSTS_ERRM > 0 {
            gint.write(&self.bus, status & GINT_CHSTS_ERRM)
        } else {
            gint.flush(&self.bus)
        }
    }

    /// Queue DCI command. The completion is called by the thread servicing interrupt.
    pub fn dci_enqueue(
        &self,
        cmd: DciCommand,
        regs: &[u16],
        vals: &[u16],
        completion: Option<DciCompletion>,
    ) -> Result<(), Error> {
        lock(&self.dci).enqueue(&self.bus, cmd, regs, vals, completion)
    }

    fn dci_wait(
        rx: mpsc::Receiver<Result<Vec<u16>, Error>>,
    ) -> Result<Result<Vec<u16>, Error>, Error> {
        rx.recv_timeout(DCI_TIMEOUT).map_err(|err| match err {
            mpsc::RecvTimeoutError::Timeout => {
                warn!("dci timeout");
                most_error(MostError::Busy, "DCI command timeout")
            }
            mpsc::RecvTimeoutError::Disconnected => {
                most_error(MostError::Shutdown, "DCI command discarded")
            }
        })
    }

    /// Read registers and wait for the values. Failure to read acknowledge results in 0xffff.
    pub fn dci_read_sync(&self, regs: &[u16]) -> Result<Vec<u16>, Error> {
        let (tx, rx) = mpsc::sync_channel(1);
        let vals = vec![0; regs.len()];
        self.dci_enqueue(
            DciCommand::Read,
            regs,
            &vals,
            Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        )?;

        match Self::dci_wait(rx)? {
            Ok(vals) => Ok(vals),
            Err(err) => {
                debug!(?err, "failed to read acknowledge");
                Ok(vec![0xffff; regs.len()])
            }
        }
    }

    /// Write registers and wait for completion.
    pub fn dci_write_sync(&self, regs: &[u16], vals: &[u16]) -> Result<(), Error> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.dci_enqueue(
            DciCommand::Write,
            regs,
            vals,
            Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        )?;
        Self::dci_wait(rx)?.map(|_| ())
    }

    pub fn attribute_show(&self, attr: DciAttribute) -> Result<String, Error> {
        let vals = self.dci_read_sync(attr.registers())?;
        Ok(attr.format(&vals))
    }

    pub fn attribute_store(&self, attr: DciAttribute, text: &str) -> Result<(), Error> {
        let vals = attr.parse(text)?;
        self.dci_write_sync(attr.registers(), &vals)
    }
}

/// The handle to request service of interrupt from any thread.
#[derive(Clone)]
pub struct InterruptTrigger(mpsc::SyncSender<()>);

impl InterruptTrigger {
    /// Request service. Returns false when coalesced with pending one.
    pub fn raise(&self) -> bool {
        match self.0.try_send(()) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(_)) => false,
            Err(mpsc::TrySendError::Disconnected(_)) => {
                debug!("interrupt worker is stopped");
                false
            }
        }
    }
}

/// The thread to service interrupt. Requests are coalesced while one is pending.
pub struct InterruptWorker {
    trigger: InterruptTrigger,
    stop: Arc<AtomicBool>,
    th: Option<thread::JoinHandle<()>>,
}

impl InterruptWorker {
    pub fn spawn(dev: &Arc<HdmDevice>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let dev = Arc::downgrade(dev);
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let th = thread::spawn(move || {
            while rx.recv().is_ok() {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                match dev.upgrade() {
                    Some(dev) => {
                        if let Err(err) = dev.service_interrupt() {
                            warn!(?err, "failed to service interrupt");
                        }
                    }
                    None => break,
                }
            }
        });

        Self {
            trigger: InterruptTrigger(tx),
            stop,
            th: Some(th),
        }
    }

    pub fn raise(&self) -> bool {
        self.trigger.raise()
    }

    pub fn trigger(&self) -> InterruptTrigger {
        self.trigger.clone()
    }
}

impl Drop for InterruptWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // The pending request wakes the thread as well.
        let _ = self.trigger.0.try_send(());
        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                error!("failed to join interrupt worker");
            }
        }
    }
}
