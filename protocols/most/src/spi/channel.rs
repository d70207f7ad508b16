// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Logical channels multiplexed over SPI bus.
//!
//! Four logical channels are available; asynchronous and control channels for both directions.
//! Each of them has software buffer to aggregate messages for transmission, or to keep received
//! messages until delivered to buffer objects.

use {
    super::*,
    tracing::{debug, warn},
};

pub const CH_ASYNC_TX: usize = 0;
pub const CH_ASYNC_RX: usize = 1;
pub const CH_CTRL_TX: usize = 2;
pub const CH_CTRL_RX: usize = 3;
pub const CH_NUM: usize = 4;

/// The index of logical channel in DCI registers.
pub const ARX_DCI_CH_IDX: u16 = 0;
pub const ATX_DCI_CH_IDX: u16 = 1;

// Interrupt status mask.
pub const GINT_CHSTS_DCITSM_B: u32 = 28;
pub const GINT_CHSTS_CTISM_B: u32 = 27;
pub const GINT_CHSTS_CRISM_B: u32 = 26;
pub const GINT_CHSTS_ATISM_B: u32 = 25;
pub const GINT_CHSTS_ARISM_B: u32 = 24;

pub const GINT_CHSTS_INTM: u32 = (1 << GINT_CHSTS_DCITSM_B)
    | (1 << GINT_CHSTS_CTISM_B)
    | (1 << GINT_CHSTS_CRISM_B)
    | (1 << GINT_CHSTS_ATISM_B)
    | (1 << GINT_CHSTS_ARISM_B);

// Interrupt status.
pub const GINT_CHSTS_DCITS_B: u32 = 20;
pub const GINT_CHSTS_CTIS_B: u32 = 19;
pub const GINT_CHSTS_CRIS_B: u32 = 18;
pub const GINT_CHSTS_ATIS_B: u32 = 17;
pub const GINT_CHSTS_ARIS_B: u32 = 16;

// Errors.
pub const GINT_CHSTS_SPI_ERR_B: u32 = 15;
pub const GINT_CHSTS_DCI_ERR_B: u32 = 14;
pub const GINT_CHSTS_CRX_ERR_B: u32 = 7;
pub const GINT_CHSTS_CTX_ERR_B: u32 = 5;
pub const GINT_CHSTS_ARX_ERR_B: u32 = 3;
pub const GINT_CHSTS_ATX_ERR_B: u32 = 1;

pub const GINT_CHSTS_ERRM: u32 = (1 << GINT_CHSTS_SPI_ERR_B)
    | (1 << GINT_CHSTS_DCI_ERR_B)
    | (1 << GINT_CHSTS_CRX_ERR_B)
    | (1 << GINT_CHSTS_CTX_ERR_B)
    | (1 << GINT_CHSTS_ARX_ERR_B)
    | (1 << GINT_CHSTS_ATX_ERR_B);

/// The size of software buffer for asynchronous transmission, same as the threshold of interrupt.
pub const ATX_BUF_SIZE: usize = 1536;
/// The size of software buffer for asynchronous reception, same as the hardware buffer.
pub const ARX_BUF_SIZE: usize = 4096;
pub const CTX_BUF_SIZE: usize = 64;
pub const CRX_BUF_SIZE: usize = 512;

/// The discriminator of message format in asynchronous channel.
pub const FPH_IDX: usize = 3;
pub const MDP_FPH: u8 = 0x0c;
pub const MEP_FPH: u8 = 0x24;

const MDP_HDR_LEN: usize = 10;
const MDP_PAD: usize = 3;
const ASYNC_MIN_HDR_LEN: usize = MDP_HDR_LEN + MDP_PAD;
const CTRL_MIN_LEN: usize = 2;
// The size for end of packet.
const EOP_SIZE: usize = 1;

/// The constant parameters of logical channel.
#[derive(Debug)]
pub struct ChannelClass {
    pub name: &'static str,
    pub direction: ChannelDirection,
    pub data_type: ChannelDataType,
    pub xch_cmd: u8,
    pub buf_info_cmd: u8,
    pub int_mask_bit: u32,
    pub int_status_bit: u32,
    pub err_status_bit: u32,
    pub buffer_size: usize,
}

pub static CHANNEL_CLASSES: [ChannelClass; CH_NUM] = [
    ChannelClass {
        name: "atx",
        direction: ChannelDirection::Tx,
        data_type: ChannelDataType::Async,
        xch_cmd: SPI_WR | ASYNC_ADDR,
        buf_info_cmd: 0x4,
        int_status_bit: GINT_CHSTS_ARIS_B,
        err_status_bit: GINT_CHSTS_ARX_ERR_B,
        int_mask_bit: GINT_CHSTS_ARISM_B,
        buffer_size: ATX_BUF_SIZE,
    },
    ChannelClass {
        name: "arx",
        direction: ChannelDirection::Rx,
        data_type: ChannelDataType::Async,
        xch_cmd: SPI_RD | ASYNC_ADDR,
        buf_info_cmd: 0x5,
        int_status_bit: GINT_CHSTS_ATIS_B,
        err_status_bit: GINT_CHSTS_ATX_ERR_B,
        int_mask_bit: GINT_CHSTS_ATISM_B,
        buffer_size: ARX_BUF_SIZE,
    },
    ChannelClass {
        name: "ctx",
        direction: ChannelDirection::Tx,
        data_type: ChannelDataType::Control,
        xch_cmd: SPI_WR | CTRL_ADDR,
        buf_info_cmd: 0x6,
        int_status_bit: GINT_CHSTS_CRIS_B,
        err_status_bit: GINT_CHSTS_CRX_ERR_B,
        int_mask_bit: GINT_CHSTS_CRISM_B,
        buffer_size: CTX_BUF_SIZE,
    },
    ChannelClass {
        name: "crx",
        direction: ChannelDirection::Rx,
        data_type: ChannelDataType::Control,
        xch_cmd: SPI_RD | CTRL_ADDR,
        buf_info_cmd: 0x7,
        int_status_bit: GINT_CHSTS_CTIS_B,
        err_status_bit: GINT_CHSTS_CTX_ERR_B,
        int_mask_bit: GINT_CHSTS_CTISM_B,
        buffer_size: CRX_BUF_SIZE,
    },
];

/// The software buffer with space for header of transaction.
#[derive(Debug)]
pub struct SoftBuffer {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    // Reserved for end of packet.
    gap: usize,
}

impl SoftBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; HEADER_SIZE + capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            gap: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[(HEADER_SIZE + self.head)..(HEADER_SIZE + self.head + self.len)]
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
        self.gap = 0;
    }

    fn consume(&mut self, count: usize) {
        let count = std::cmp::min(count, self.len);
        self.len -= count;
        self.head = if self.len == 0 { 0 } else { self.head + count };
    }

    // The whole space after the data is available since reception never appends.
    fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        let pos = HEADER_SIZE + self.head + self.len;
        if pos + data.len() > self.buf.len() {
            let msg = format!(
                "{} bytes exceed space of software buffer {}",
                data.len(),
                self.buf.len() - pos
            );
            Err(most_error(MostError::NoSpace, &msg))?;
        }
        self.buf[pos..(pos + data.len())].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    // The transaction for the length of payload from the head of buffer.
    fn frame_mut(&mut self, opcode: u8, len: usize) -> Result<&mut [u8], Error> {
        let size = round_up4(HEADER_SIZE + len);
        if size > self.buf.len() {
            let msg = format!("Transaction of {} bytes exceeds software buffer", size);
            Err(most_error(MostError::NoSpace, &msg))?;
        }
        build_header(&mut self.buf, opcode, len)?;
        Ok(&mut self.buf[..size])
    }
}

/// The state of logical channel, derived from the size known in hardware and the data in
/// software buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    BufSizeKnown,
    DataPending,
}

/// Copy a message from the head of received data to buffer object. Returns the length of
/// consumed data and the length of message.
pub fn unpack_ctrl_message(data: &[u8], dst: &mut [u8]) -> Result<(usize, usize), Error> {
    if data.len() < CTRL_MIN_LEN {
        let msg = format!("Too small payload: {}", data.len());
        Err(most_error(MostError::Inval, &msg))?;
    }
    unpack_message(data, dst)
}

/// Copy a message of asynchronous channel. MEP is copied verbatim. The padding after header of
/// MDP is dropped.
pub fn unpack_async_message(data: &[u8], dst: &mut [u8]) -> Result<(usize, usize), Error> {
    if data.len() < ASYNC_MIN_HDR_LEN {
        let msg = format!("Too small payload: {}", data.len());
        Err(most_error(MostError::Inval, &msg))?;
    }

    match data[FPH_IDX] {
        MEP_FPH => unpack_message(data, dst),
        MDP_FPH => unpack_padded_message(data, dst),
        fph => {
            let msg = format!("False FPH: 0x{:02x}", fph);
            Err(most_error(MostError::Inval, &msg))
        }
    }
}

fn message_length(data: &[u8]) -> usize {
    (((data[0] as usize) << 8) | data[1] as usize) + 2
}

fn unpack_message(data: &[u8], dst: &mut [u8]) -> Result<(usize, usize), Error> {
    let msg_len = message_length(data);
    if msg_len > data.len() {
        let msg = format!("Length out of buffer size: {} {}", msg_len, data.len());
        Err(most_error(MostError::Inval, &msg))?;
    }
    if msg_len > dst.len() {
        let msg = format!("Too big message for buffer object: {}", msg_len);
        Err(most_error(MostError::NoSpace, &msg))?;
    }
    dst[..msg_len].copy_from_slice(&data[..msg_len]);
    Ok((msg_len, msg_len))
}

fn unpack_padded_message(data: &[u8], dst: &mut [u8]) -> Result<(usize, usize), Error> {
    let msg_len = message_length(data);
    let padded_len = msg_len + MDP_PAD;
    if msg_len < MDP_HDR_LEN || padded_len > data.len() {
        let msg = format!("Length out of buffer size: {} {}", padded_len, data.len());
        Err(most_error(MostError::Inval, &msg))?;
    }
    if msg_len > dst.len() {
        let msg = format!("Too big message for buffer object: {}", msg_len);
        Err(most_error(MostError::NoSpace, &msg))?;
    }
    dst[..MDP_HDR_LEN].copy_from_slice(&data[..MDP_HDR_LEN]);
    dst[MDP_HDR_LEN..msg_len].copy_from_slice(&data[(MDP_HDR_LEN + MDP_PAD)..padded_len]);
    Ok((padded_len, msg_len))
}

enum Transfer {
    Done,
    Wait,
    Reject,
}

/// The logical channel.
#[derive(Debug)]
pub struct HdmChannel {
    class: &'static ChannelClass,
    configured: bool,
    spi_buf_sz: usize,
    buf: SoftBuffer,
    waiting: VecDeque<Mbo>,
}

impl HdmChannel {
    pub fn new(class: &'static ChannelClass) -> Self {
        Self {
            class,
            configured: false,
            spi_buf_sz: 0,
            buf: SoftBuffer::new(class.buffer_size),
            waiting: Default::default(),
        }
    }

    pub fn class(&self) -> &'static ChannelClass {
        self.class
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn state(&self) -> ChannelState {
        if !self.buf.is_empty() {
            ChannelState::DataPending
        } else if self.spi_buf_sz > 0 {
            ChannelState::BufSizeKnown
        } else {
            ChannelState::Idle
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub(crate) fn init(&mut self) {
        self.configured = true;
        self.spi_buf_sz = 0;
        self.buf.reset();
    }

    pub(crate) fn push(&mut self, mbo: Mbo) {
        self.waiting.push_back(mbo);
    }

    /// Query available size in hardware. Any non-zero value for transmission means the space is
    /// available since the software buffer is not larger than the threshold of interrupt.
    pub(crate) fn update_buf_size(&mut self, bus: &SpiBus) -> Result<(), Error> {
        self.spi_buf_sz = match self.class.direction {
            ChannelDirection::Rx => (bus.read_reg(self.class.buf_info_cmd)? & 0xffff) as usize,
            ChannelDirection::Tx => 1,
        };
        Ok(())
    }

    /// Transfer data between hardware, software buffer, and waiting buffer objects. The completed
    /// buffer objects are pushed to the list. Returns whether the interrupt should be enabled.
    pub(crate) fn xfer(&mut self, bus: &SpiBus, completed: &mut Vec<Mbo>) -> bool {
        match self.class.direction {
            ChannelDirection::Rx => {
                self.spi_to_buf(bus);
                self.xfer_mbos(completed);
                self.buf.is_empty()
            }
            ChannelDirection::Tx => {
                self.buf_to_spi(bus);
                self.xfer_mbos(completed);
                !self.buf.is_empty()
            }
        }
    }

    /// Detach the channel, then return all of waiting buffer objects with closed status.
    pub(crate) fn poison(&mut self) -> Vec<Mbo> {
        self.configured = false;
        self.spi_buf_sz = 0;
        self.buf.reset();
        self.waiting
            .drain(..)
            .map(|mut mbo| {
                mbo.clear_processed_length();
                mbo.set_status(MboStatus::Close);
                mbo
            })
            .collect()
    }

    fn xfer_mbos(&mut self, completed: &mut Vec<Mbo>) {
        while let Some(mut mbo) = self.waiting.pop_front() {
            match self.xfer_mbo(&mut mbo) {
                Transfer::Done => {
                    mbo.set_status(MboStatus::Success);
                    completed.push(mbo);
                }
                Transfer::Reject => {
                    mbo.clear_processed_length();
                    mbo.set_status(MboStatus::Invalid);
                    completed.push(mbo);
                }
                Transfer::Wait => {
                    self.waiting.push_front(mbo);
                    break;
                }
            }
        }
    }

    fn xfer_mbo(&mut self, mbo: &mut Mbo) -> Transfer {
        match (self.class.direction, self.class.data_type) {
            (ChannelDirection::Rx, data_type) => self.buf_to_mbo(mbo, data_type),
            (ChannelDirection::Tx, ChannelDataType::Control) => self.ctrl_mbo_to_buf(mbo),
            (ChannelDirection::Tx, _) => self.async_mbo_to_buf(mbo),
        }
    }

    fn spi_to_buf(&mut self, bus: &SpiBus) {
        if self.spi_buf_sz == 0 || !self.buf.is_empty() {
            return;
        }

        let len = self.spi_buf_sz;
        let frame = match self.buf.frame_mut(self.class.xch_cmd, len) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(name = self.class.name, len, ?err, "too small buffer");
                return;
            }
        };
        if bus.exchange(frame).is_err() {
            return;
        }

        self.buf.head = 0;
        self.buf.len = len;
        self.spi_buf_sz = 0;
    }

    fn buf_to_mbo(&mut self, mbo: &mut Mbo, data_type: ChannelDataType) -> Transfer {
        if self.buf.is_empty() {
            return Transfer::Wait;
        }

        let res = if data_type == ChannelDataType::Control {
            unpack_ctrl_message(self.buf.data(), mbo.data_mut())
        } else {
            unpack_async_message(self.buf.data(), mbo.data_mut())
        };

        match res {
            Ok((consumed, len)) => {
                self.buf.consume(consumed);
                match mbo.set_processed_length(len) {
                    Ok(()) => Transfer::Done,
                    Err(err) => {
                        warn!(name = self.class.name, len, ?err, "message exceeds buffer");
                        Transfer::Reject
                    }
                }
            }
            Err(err) => {
                // The rest of data is not parsable anymore.
                warn!(name = self.class.name, pending = self.buf.len(), ?err, "framing error");
                self.buf.reset();
                Transfer::Wait
            }
        }
    }

    fn ctrl_mbo_to_buf(&mut self, mbo: &mut Mbo) -> Transfer {
        let msg_len = mbo.buffer_length();

        if !self.buf.is_empty() {
            return Transfer::Wait;
        }

        if msg_len > self.buf.capacity() {
            warn!(name = self.class.name, msg_len, "too big message");
            return Transfer::Reject;
        }

        match self.buf.append(mbo.data()) {
            Ok(()) => {
                if let Err(err) = mbo.set_processed_length(msg_len) {
                    debug!(
                        name = self.class.name,
                        msg_len,
                        ?err,
                        "processed length is not updated"
                    );
                }
                Transfer::Done
            }
            Err(_) => Transfer::Wait,
        }
    }

    fn async_mbo_to_buf(&mut self, mbo: &mut Mbo) -> Transfer {
        let msg_len = mbo.buffer_length();
        let spi_data_sz = self.buf.len() + self.buf.gap + msg_len + EOP_SIZE;

        if spi_data_sz > self.buf.capacity() {
            if self.buf.is_empty() {
                warn!(name = self.class.name, msg_len, "too big message");
                return Transfer::Reject;
            } else {
                return Transfer::Wait;
            }
        }

        match self.buf.append(mbo.data()) {
            Ok(()) => {
                self.buf.gap += EOP_SIZE;
                if let Err(err) = mbo.set_processed_length(msg_len) {
                    debug!(
                        name = self.class.name,
                        msg_len,
                        ?err,
                        "processed length is not updated"
                    );
                }
                Transfer::Done
            }
            Err(_) => Transfer::Wait,
        }
    }

    fn buf_to_spi(&mut self, bus: &SpiBus) {
        if self.buf.is_empty() || self.spi_buf_sz == 0 {
            return;
        }

        let len = self.buf.len();
        let frame = match self.buf.frame_mut(self.class.xch_cmd, len) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(name = self.class.name, len, ?err, "too large data");
                return;
            }
        };
        if bus.write(frame).is_err() {
            return;
        }

        self.spi_buf_sz = 0;
        self.buf.reset();
    }
}
