// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Transport over character device of Linux spidev driver.

use {
    glib::{Error, FileError},
    most_protocols::spi::SpiTransport,
    nix::errno::Errno,
    std::{
        fs::{File, OpenOptions},
        os::unix::io::AsRawFd,
    },
    tracing::debug,
};

const SPI_IOC_MAGIC: u8 = b'k';

nix::ioctl_write_buf!(spi_ioc_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);
nix::ioctl_write_ptr!(spi_ioc_wr_mode, SPI_IOC_MAGIC, 1, u8);
nix::ioctl_write_ptr!(spi_ioc_wr_bits_per_word, SPI_IOC_MAGIC, 3, u8);
nix::ioctl_write_ptr!(spi_ioc_wr_max_speed_hz, SPI_IOC_MAGIC, 4, u32);

/// The layout of struct spi_ioc_transfer in UAPI of Linux kernel.
#[repr(C)]
#[derive(Default, Debug)]
pub struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

const BITS_PER_WORD: u8 = 8;

fn errno_to_error(errno: Errno, label: &str) -> Error {
    let kind = match errno {
        Errno::ENOENT => FileError::Noent,
        Errno::EACCES | Errno::EPERM => FileError::Acces,
        Errno::EINVAL => FileError::Inval,
        Errno::ENODEV | Errno::ENXIO => FileError::Nxio,
        Errno::EBUSY => FileError::Again,
        _ => FileError::Io,
    };
    let msg = format!("{}: {}", label, errno.desc());
    Error::new(kind, &msg)
}

/// The character device of spidev.
#[derive(Debug)]
pub struct SpiDev {
    file: File,
    speed_hz: u32,
}

impl SpiDev {
    pub fn open(path: &str, mode: u8, speed_hz: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                let errno = err.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO);
                errno_to_error(errno, path)
            })?;

        let fd = file.as_raw_fd();
        unsafe { spi_ioc_wr_mode(fd, &mode) }
            .map_err(|errno| errno_to_error(errno, "SPI_IOC_WR_MODE"))?;
        unsafe { spi_ioc_wr_bits_per_word(fd, &BITS_PER_WORD) }
            .map_err(|errno| errno_to_error(errno, "SPI_IOC_WR_BITS_PER_WORD"))?;
        unsafe { spi_ioc_wr_max_speed_hz(fd, &speed_hz) }
            .map_err(|errno| errno_to_error(errno, "SPI_IOC_WR_MAX_SPEED_HZ"))?;

        debug!(path, mode, speed_hz, "spidev opened");

        Ok(Self { file, speed_hz })
    }

    fn transfer_desc(&self, tx: &[u8], rx: Option<&mut [u8]>) -> SpiIocTransfer {
        SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.map(|buf| buf.as_mut_ptr() as u64).unwrap_or(0),
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: BITS_PER_WORD,
            ..Default::default()
        }
    }
}

impl SpiTransport for SpiDev {
    fn transfer(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<(), Error> {
        if let Some(buf) = &rx {
            if buf.len() != tx.len() {
                let msg = format!("Length mismatch: tx {}, rx {}", tx.len(), buf.len());
                return Err(Error::new(FileError::Inval, &msg));
            }
        }

        let desc = self.transfer_desc(tx, rx);
        unsafe { spi_ioc_message(self.file.as_raw_fd(), &[desc]) }
            .map(|_| ())
            .map_err(|errno| errno_to_error(errno, "SPI_IOC_MESSAGE"))
    }
}
