// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Queue of commands for Driver Control Interface (DCI).
//!
//! The command to read or write registers is sent as a block, then requested by control register.
//! The completion is notified by interrupt. The commands are processed one by one in the order of
//! enqueue. While no command is queued, the interface waits for notification of network change.

use {
    super::*,
    tracing::{debug, error, warn},
};

pub const DCI_CTRL_ERRDM_BM: u32 = 1 << 26;
pub const DCI_CTRL_ONTFM_BM: u32 = 1 << 25;
pub const DCI_CTRL_CMDDONEM_BM: u32 = 1 << 24;
pub const DCI_CTRL_ERRD_BM: u32 = 1 << 18;
pub const DCI_CTRL_ONTF_BM: u32 = 1 << 17;
pub const DCI_CTRL_CMDDONE_BM: u32 = 1 << 16;
pub const DCI_CTRL_CMDREQ_BM: u32 = 1 << 1;
pub const DCI_CTRL_SYNCREQ_BM: u32 = 1 << 0;

/// The number of jobs available at once.
pub const DCI_JOB_COUNT: usize = 14;
/// The maximum number of registers in a command.
pub const DCI_MAX_REGS: usize = 7;

/// The time to wait for completion of command.
pub const DCI_TIMEOUT: Duration = Duration::from_millis(1000);

pub const DCI_REG_NOTIFY: u16 = 0x3002;

pub const fn dci_reg_events(ch_idx: u16) -> u16 {
    0x3100 | (ch_idx << 4)
}

pub const fn dci_reg_config(ch_idx: u16) -> u16 {
    0x3102 | (ch_idx << 4)
}

pub const fn dci_reg_onoff_state(ch_idx: u16) -> u16 {
    0x3107 | (ch_idx << 4)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DciCommand {
    Read,
    Write,
}

impl DciCommand {
    pub fn code(&self) -> u8 {
        match self {
            DciCommand::Read => 0xa0,
            DciCommand::Write => 0xa1,
        }
    }
}

/// Called with the values of registers for read command, or empty for write command.
pub type DciCompletion = Box<dyn FnOnce(Result<Vec<u16>, Error>) + Send>;

struct DciJob {
    cmd: DciCommand,
    regs: Vec<u16>,
    vals: Vec<u16>,
    completion: Option<DciCompletion>,
}

/// The mode to service interrupt of DCI.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceMode {
    /// Wait for notification.
    Notify,
    /// Wait for done of command.
    Command,
}

/// The result of servicing interrupt. The completions are expected to be called without lock of
/// queue.
#[derive(Default)]
pub struct DciEvents {
    pub completed: Vec<(DciCompletion, Result<Vec<u16>, Error>)>,
    /// Notification of network change arrived.
    pub notified: bool,
}

impl DciEvents {
    pub fn complete(self) {
        self.completed
            .into_iter()
            .for_each(|(completion, res)| completion(res));
    }
}

/// Serialize the block of command.
pub fn encode_request(cmd: DciCommand, regs: &[u16], vals: &[u16]) -> Result<Vec<u8>, Error> {
    if regs.is_empty() || regs.len() > DCI_MAX_REGS || regs.len() != vals.len() {
        let msg = format!(
            "Invalid number of registers: {} and values: {}",
            regs.len(),
            vals.len()
        );
        Err(most_error(MostError::Inval, &msg))?;
    }

    // The terminator of two zero bytes is in the padding.
    let mut payload = vec![cmd.code(), regs.len() as u8];
    regs.iter().zip(vals).for_each(|(reg, val)| {
        payload.extend_from_slice(&reg.to_be_bytes());
        payload.extend_from_slice(&val.to_be_bytes());
    });
    encode_frame(DCI_ADDR | SPI_WR, &payload)
}

/// The transaction to read acknowledge including values of registers.
pub fn encode_ack_request(num: usize) -> Vec<u8> {
    let len = num * 4 + 2;
    let mut frame = vec![0; round_up4(HEADER_SIZE + len)];
    frame[0] = DCI_ADDR | SPI_RD;
    frame[2] = (len >> 8) as u8;
    frame[3] = len as u8;
    frame
}

pub fn decode_ack(frame: &[u8], num: usize) -> Result<Vec<u16>, Error> {
    if frame.len() < 8 + num * 4 {
        let msg = format!("Acknowledge too short for {} registers", num);
        Err(most_error(MostError::Io, &msg))?;
    }
    Ok((0..num)
        .map(|i| u16::from_be_bytes([frame[8 + i * 4], frame[9 + i * 4]]))
        .collect())
}

fn read_ack(bus: &SpiBus, num: usize) -> Result<Vec<u16>, Error> {
    let mut frame = encode_ack_request(num);
    bus.exchange(&mut frame)?;
    decode_ack(&frame, num)
}

/// The queue of commands. One command is active at most.
pub struct DciQueue {
    mode: ServiceMode,
    active_int: u32,
    jobs: VecDeque<DciJob>,
}

impl Default for DciQueue {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Notify,
            active_int: DCI_CTRL_ERRDM_BM | DCI_CTRL_ONTFM_BM,
            jobs: Default::default(),
        }
    }
}

impl DciQueue {
    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    /// The number of queued jobs including the active one.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn ctrl_write(&self, bus: &SpiBus, cmd: u32) -> Result<(), Error> {
        let cmd = cmd | DCI_CTRL_ERRDM_BM | DCI_CTRL_ONTFM_BM | DCI_CTRL_CMDDONEM_BM;
        bus.write_reg(DCI_CTRL_ADDR, cmd & !self.active_int)
    }

    pub(crate) fn init(&mut self, bus: &SpiBus) -> Result<(), Error> {
        self.mode = ServiceMode::Notify;
        self.active_int = DCI_CTRL_ERRDM_BM | DCI_CTRL_ONTFM_BM;
        self.ctrl_write(bus, 0)
    }

    /// Queue the command. It is issued immediately when no command is active.
    pub(crate) fn enqueue(
        &mut self,
        bus: &SpiBus,
        cmd: DciCommand,
        regs: &[u16],
        vals: &[u16],
        completion: Option<DciCompletion>,
    ) -> Result<(), Error> {
        if regs.is_empty() || regs.len() > DCI_MAX_REGS || regs.len() != vals.len() {
            let msg = format!("Invalid DCI command for {} registers", regs.len());
            Err(most_error(MostError::Inval, &msg))?;
        }

        if self.jobs.len() >= DCI_JOB_COUNT {
            error!(queued = self.jobs.len(), "dci jobs overflow");
            Err(most_error(MostError::Again, "DCI jobs overflow"))?;
        }

        self.jobs.push_back(DciJob {
            cmd,
            regs: regs.to_vec(),
            vals: vals.to_vec(),
            completion,
        });
        self.start_request(bus);

        Ok(())
    }

    fn start_request(&mut self, bus: &SpiBus) {
        if self.mode == ServiceMode::Command {
            return;
        }

        self.mode = ServiceMode::Command;
        self.active_int = DCI_CTRL_ERRDM_BM | DCI_CTRL_CMDDONEM_BM;
        if let Err(err) = self.ctrl_write(bus, 0) {
            warn!(?err, "failed to enter command mode");
        }
        self.request(bus);
    }

    fn request(&self, bus: &SpiBus) {
        if let Some(job) = self.jobs.front() {
            debug!(cmd = ?job.cmd, regs = ?job.regs, "issue dci job");
            let res = encode_request(job.cmd, &job.regs, &job.vals)
                .and_then(|frame| bus.write(&frame))
                .and_then(|_| self.ctrl_write(bus, DCI_CTRL_CMDREQ_BM));
            if let Err(err) = res {
                warn!(?err, "failed to request dci job");
            }
        }
    }

    /// Service interrupt according to the value of control register.
    pub(crate) fn service(&mut self, bus: &SpiBus, dci_ctrl: u32) -> DciEvents {
        let mut events = DciEvents::default();

        let error = dci_ctrl & DCI_CTRL_ERRD_BM;
        if error > 0 {
            warn!(dci_ctrl, "dci critical error");
            let _ = self.ctrl_write(bus, error);
        }

        match self.mode {
            ServiceMode::Notify => {
                let ntf = dci_ctrl & DCI_CTRL_ONTF_BM;
                if ntf > 0 {
                    debug!("dci notification");
                    let _ = self.ctrl_write(bus, ntf);
                    events.notified = true;
                }
            }
            ServiceMode::Command => {
                let cmd_done = dci_ctrl & DCI_CTRL_CMDDONE_BM;
                if cmd_done == 0 {
                    return events;
                }

                match self.jobs.pop_front() {
                    Some(job) => {
                        let res = match job.cmd {
                            DciCommand::Read => read_ack(bus, job.regs.len()),
                            DciCommand::Write => Ok(Vec::new()),
                        };
                        debug!(cmd = ?job.cmd, regs = ?job.regs, ok = res.is_ok(), "dci job done");
                        if let Some(completion) = job.completion {
                            events.completed.push((completion, res));
                        }
                    }
                    None => warn!("dci command done without job"),
                }

                if !self.jobs.is_empty() {
                    let _ = self.ctrl_write(bus, cmd_done);
                    self.request(bus);
                } else {
                    self.mode = ServiceMode::Notify;
                    self.active_int = DCI_CTRL_ERRDM_BM | DCI_CTRL_ONTFM_BM;
                    let _ = self.ctrl_write(bus, cmd_done);
                }
            }
        }

        events
    }

    /// Discard all of jobs. The waiters are notified by drop of completion.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.jobs.len();
        self.jobs.clear();
        self.mode = ServiceMode::Notify;
        self.active_int = DCI_CTRL_ERRDM_BM | DCI_CTRL_ONTFM_BM;
        count
    }
}

/// The attribute of network interface controller, accessible by DCI.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DciAttribute {
    PacketBw,
    NodeAddress,
    NodePosition,
    LastResetReason,
    PacketFilterMode,
    PacketHash,
    PacketEui48,
    PacketLlrTime,
}

impl DciAttribute {
    pub const ALL: [Self; 8] = [
        Self::PacketBw,
        Self::NodeAddress,
        Self::NodePosition,
        Self::LastResetReason,
        Self::PacketFilterMode,
        Self::PacketHash,
        Self::PacketEui48,
        Self::PacketLlrTime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PacketBw => "packet_bw",
            Self::NodeAddress => "node_address",
            Self::NodePosition => "node_position",
            Self::LastResetReason => "last_reset_reason",
            Self::PacketFilterMode => "packet_filter_mode",
            Self::PacketHash => "packet_hash",
            Self::PacketEui48 => "packet_eui48",
            Self::PacketLlrTime => "packet_llr_time",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|attr| attr.name() == name).copied()
    }

    pub fn registers(&self) -> &'static [u16] {
        match self {
            Self::PacketBw => &[0x101],
            Self::NodeAddress => &[0x102],
            Self::NodePosition => &[0x103],
            Self::LastResetReason => &[0x120],
            Self::PacketFilterMode => &[0x140],
            Self::PacketHash => &[0x141, 0x142, 0x143, 0x144],
            Self::PacketEui48 => &[0x145, 0x146, 0x147],
            Self::PacketLlrTime => &[0x148],
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Self::PacketBw | Self::NodeAddress | Self::NodePosition | Self::LastResetReason => {
                false
            }
            _ => true,
        }
    }

    /// Format the values of registers.
    pub fn format(&self, vals: &[u16]) -> String {
        let val = |i: usize| vals.get(i).copied().unwrap_or(0xffff);
        match self {
            Self::PacketHash => format!(
                "{:04X} {:04X} {:04X} {:04X}\n",
                val(0),
                val(1),
                val(2),
                val(3)
            ),
            Self::PacketEui48 => format!(
                "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}\n",
                val(0) >> 8,
                val(0) & 0xff,
                val(1) >> 8,
                val(1) & 0xff,
                val(2) >> 8,
                val(2) & 0xff
            ),
            _ => format!("0x{:04X}\n", val(0)),
        }
    }

    /// Parse the text to values of registers.
    pub fn parse(&self, text: &str) -> Result<Vec<u16>, Error> {
        if !self.is_writable() {
            let msg = format!("{} is read-only", self.name());
            Err(most_error(MostError::NotSupported, &msg))?;
        }

        match self {
            Self::PacketHash => parse_hex_groups(text, 4, 4, b' '),
            Self::PacketEui48 => {
                let octets = parse_hex_groups(text, 6, 2, b'-')?;
                Ok(octets
                    .chunks_exact(2)
                    .map(|pair| (pair[0] << 8) | pair[1])
                    .collect())
            }
            _ => parse_u16(text).map(|val| vec![val]),
        }
    }
}

fn parse_u16(text: &str) -> Result<u16, Error> {
    let val = parse_uint(text).ok_or_else(|| {
        let msg = format!("Invalid value: {}", text.trim());
        most_error(MostError::Inval, &msg)
    })?;
    if val > u16::MAX as u64 {
        let msg = format!("Value out of range: {}", val);
        Err(most_error(MostError::Range, &msg))
    } else {
        Ok(val as u16)
    }
}

// Any delimiter is optional. Trailing data is allowed just for new line.
fn parse_hex_groups(text: &str, groups: usize, digits: usize, delim: u8) -> Result<Vec<u16>, Error> {
    let inval = || {
        let msg = format!("Invalid format: {}", text.trim_end());
        most_error(MostError::Inval, &msg)
    };

    let mut rest = text.as_bytes();
    let mut vals = Vec::with_capacity(groups);
    for _ in 0..groups {
        if rest.len() < digits {
            return Err(inval());
        }
        let val = rest[..digits].iter().try_fold(0u16, |val, &b| {
            (b as char)
                .to_digit(16)
                .map(|digit| (val << 4) | digit as u16)
        });
        vals.push(val.ok_or_else(inval)?);
        rest = &rest[digits..];
        if rest.first() == Some(&delim) {
            rest = &rest[1..];
        }
    }

    match rest.first() {
        None | Some(b'\n') => Ok(vals),
        _ => Err(inval()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_block() {
        let frame = encode_request(DciCommand::Write, &[0x3102, 0x0140], &[0x0007, 0xbeef]).unwrap();
        assert_eq!(
            frame,
            [
                0x10, 0x00, 0x00, 0x0a, 0xa1, 0x02, 0x31, 0x02, 0x00, 0x07, 0x01, 0x40, 0xbe, 0xef,
                0x00, 0x00
            ]
        );

        let frame = encode_request(DciCommand::Read, &[0x101], &[0]).unwrap();
        assert_eq!(frame, [0x10, 0x00, 0x00, 0x06, 0xa0, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);

        assert!(encode_request(DciCommand::Read, &[], &[]).is_err());
        assert!(encode_request(DciCommand::Read, &[0; 8], &[0; 8]).is_err());
        assert!(encode_request(DciCommand::Write, &[1, 2], &[0]).is_err());
    }

    #[test]
    fn acknowledge() {
        let frame = encode_ack_request(2);
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..4], &[0x90, 0x00, 0x00, 0x0a]);

        let reply = [
            0x90, 0x00, 0x00, 0x0a, 0xa0, 0x02, 0x01, 0x45, 0x12, 0x34, 0x01, 0x46, 0xab, 0xcd,
            0x00, 0x00,
        ];
        assert_eq!(decode_ack(&reply, 2).unwrap(), vec![0x1234, 0xabcd]);
        assert!(decode_ack(&reply[..10], 2).is_err());
    }

    #[test]
    fn register_addresses() {
        assert_eq!(dci_reg_events(ATX_DCI_CH_IDX), 0x3110);
        assert_eq!(dci_reg_events(ARX_DCI_CH_IDX), 0x3100);
        assert_eq!(dci_reg_config(ATX_DCI_CH_IDX), 0x3112);
        assert_eq!(dci_reg_config(ARX_DCI_CH_IDX), 0x3102);
        assert_eq!(dci_reg_onoff_state(ATX_DCI_CH_IDX), 0x3117);
        assert_eq!(dci_reg_onoff_state(ARX_DCI_CH_IDX), 0x3107);
    }

    #[test]
    fn attribute_format() {
        assert_eq!(DciAttribute::PacketBw.format(&[0x2a]), "0x002A\n");
        assert_eq!(
            DciAttribute::PacketHash.format(&[0x1, 0xabcd, 0x0, 0xffff]),
            "0001 ABCD 0000 FFFF\n"
        );
        assert_eq!(
            DciAttribute::PacketEui48.format(&[0x0012, 0x34ab, 0xcdef]),
            "00-12-34-AB-CD-EF\n"
        );
        assert_eq!(
            DciAttribute::from_name("packet_llr_time"),
            Some(DciAttribute::PacketLlrTime)
        );
        assert_eq!(DciAttribute::from_name("packet_bandwidth"), None);
    }

    #[test]
    fn attribute_parse() {
        let attr = DciAttribute::PacketFilterMode;
        assert_eq!(attr.parse("0x10\n").unwrap(), vec![0x10]);
        assert_eq!(attr.parse("010").unwrap(), vec![8]);
        assert_eq!(attr.parse("65535").unwrap(), vec![0xffff]);
        let err = attr.parse("65536").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Range));
        assert!(attr.parse("x").is_err());

        let err = DciAttribute::NodeAddress.parse("1").unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NotSupported));

        let attr = DciAttribute::PacketHash;
        assert_eq!(
            attr.parse("0001 abcd 0000 FFFF\n").unwrap(),
            vec![0x1, 0xabcd, 0x0, 0xffff]
        );
        assert_eq!(
            attr.parse("0001abcd0000FFFF").unwrap(),
            vec![0x1, 0xabcd, 0x0, 0xffff]
        );
        assert!(attr.parse("0001 abcd 0000").is_err());
        assert!(attr.parse("0001 abcd 0000 FFFF 0").is_err());
        assert!(attr.parse("0001 abcg 0000 FFFF").is_err());

        let attr = DciAttribute::PacketEui48;
        assert_eq!(
            attr.parse("00-12-34-ab-cd-ef\n").unwrap(),
            vec![0x0012, 0x34ab, 0xcdef]
        );
        assert_eq!(attr.parse("001234abcdef").unwrap(), vec![0x0012, 0x34ab, 0xcdef]);
        assert!(attr.parse("00-12-34-ab-cd").is_err());
        assert!(attr.parse("00:12:34:ab:cd:ef").is_err());
    }
}
