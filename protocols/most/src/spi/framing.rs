// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Framing of transaction over SPI bus.
//!
//! Any transaction starts with 4 bytes header; opcode, reserved byte, and the length of payload in
//! big endian. The payload follows, then the transaction is padded to multiple of 4 bytes.

use super::*;

pub const SPI_WR: u8 = 0x00;
pub const SPI_RD: u8 = 0x80;

pub const DR_CONFIG_ADDR: u8 = 0x00;
pub const GINT_CHSTS_ADDR: u8 = 0x01;
pub const DCI_CTRL_ADDR: u8 = 0x03;
pub const DCI_ADDR: u8 = 0x10;
pub const ASYNC_ADDR: u8 = 0x12;
pub const CTRL_ADDR: u8 = 0x14;

pub const HEADER_SIZE: usize = 4;
/// The maximum length of payload expressed in header.
pub const MAX_PAYLOAD_SIZE: usize = 0xffff;

const REG_FRAME_SIZE: usize = HEADER_SIZE + 4;

/// Round up the length of transaction to multiple of 4.
pub fn round_up4(len: usize) -> usize {
    (len + 3) & !3
}

/// Fill header in the head of buffer.
pub fn build_header(buf: &mut [u8], opcode: u8, len: usize) -> Result<(), Error> {
    if len > MAX_PAYLOAD_SIZE {
        let msg = format!("Payload length {} exceeds {}", len, MAX_PAYLOAD_SIZE);
        Err(most_error(MostError::Range, &msg))?;
    }
    if buf.len() < HEADER_SIZE {
        Err(most_error(MostError::Inval, "Buffer too short for header"))?;
    }
    buf[0] = opcode;
    buf[1] = 0;
    buf[2] = (len >> 8) as u8;
    buf[3] = len as u8;
    Ok(())
}

/// Parse header to retrieve opcode and length of payload.
pub fn parse_header(buf: &[u8]) -> Option<(u8, usize)> {
    if buf.len() < HEADER_SIZE {
        None
    } else {
        Some((buf[0], ((buf[2] as usize) << 8) | buf[3] as usize))
    }
}

/// Serialize whole transaction including padding.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut frame = vec![0; round_up4(HEADER_SIZE + payload.len())];
    build_header(&mut frame, opcode, payload.len())?;
    frame[HEADER_SIZE..(HEADER_SIZE + payload.len())].copy_from_slice(payload);
    Ok(frame)
}

/// Parse whole transaction. The length of frame should be aligned to the length of payload.
pub fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8]), Error> {
    let (opcode, len) = parse_header(frame)
        .ok_or_else(|| most_error(MostError::Inval, "Frame too short for header"))?;
    if frame.len() != round_up4(HEADER_SIZE + len) {
        let msg = format!(
            "Frame length {} mismatch to payload length {}",
            frame.len(),
            len
        );
        Err(most_error(MostError::Inval, &msg))?;
    }
    Ok((opcode, &frame[HEADER_SIZE..(HEADER_SIZE + len)]))
}

pub fn encode_reg_write(reg: u8, val: u32) -> [u8; REG_FRAME_SIZE] {
    let mut frame = [0; REG_FRAME_SIZE];
    frame[0] = SPI_WR | reg;
    frame[3] = 4;
    frame[4..].copy_from_slice(&val.to_be_bytes());
    frame
}

pub fn encode_reg_read(reg: u8) -> [u8; REG_FRAME_SIZE] {
    let mut frame = [0; REG_FRAME_SIZE];
    frame[0] = SPI_RD | reg;
    frame[3] = 4;
    frame
}

pub fn decode_reg_value(frame: &[u8; REG_FRAME_SIZE]) -> u32 {
    let mut quadlet = [0; 4];
    quadlet.copy_from_slice(&frame[4..]);
    u32::from_be_bytes(quadlet)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload: Vec<u8> = (0..(MAX_PAYLOAD_SIZE + 1)).map(|i| (i * 7) as u8).collect();

        (0..4100)
            .chain([0x1fff, 0x8000, 0xfffd, 0xfffe, MAX_PAYLOAD_SIZE].iter().copied())
            .for_each(|len| {
                let frame = encode_frame(ASYNC_ADDR, &payload[..len]).unwrap();
                assert_eq!(frame.len() % 4, 0);
                assert!(frame.len() >= HEADER_SIZE + len);
                assert!(frame.len() < HEADER_SIZE + len + 4);
                assert!(frame[(HEADER_SIZE + len)..].iter().all(|&b| b == 0));

                let (opcode, decoded) = decode_frame(&frame).unwrap();
                assert_eq!(opcode, ASYNC_ADDR);
                assert_eq!(decoded, &payload[..len], "length {}", len);
            });

        let err = encode_frame(CTRL_ADDR, &payload).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Range));
    }

    #[test]
    fn frame_malformed() {
        assert!(decode_frame(&[0x12, 0x00]).is_err());
        // Not padded.
        assert!(decode_frame(&[0x12, 0x00, 0x00, 0x01, 0xaa]).is_err());
        // Length beyond the frame.
        assert!(decode_frame(&[0x12, 0x00, 0x00, 0x09, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn register_frame() {
        assert_eq!(
            encode_reg_write(GINT_CHSTS_ADDR, 0x1f00_c0aa),
            [0x01, 0x00, 0x00, 0x04, 0x1f, 0x00, 0xc0, 0xaa]
        );
        let frame = encode_reg_read(DCI_CTRL_ADDR);
        assert_eq!(frame, [0x83, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            decode_reg_value(&[0x83, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]),
            0x0102_0304
        );
        assert_eq!(round_up4(0), 0);
        assert_eq!(round_up4(5), 8);
        assert_eq!(round_up4(8), 8);
    }
}
