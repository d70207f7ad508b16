// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod aim;
pub mod extension;
pub mod frame;
pub mod isostream;
pub mod mbo;
pub mod mlb150;
pub mod registry;
pub mod spi;
pub mod syncsound;

use {
    glib::{error::ErrorDomain, Error, Quark},
    std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    std::time::Duration,
};

/// Direction of channel, seen from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelDirection {
    /// From the network to the host.
    Rx,
    /// From the host to the network.
    Tx,
}

impl Default for ChannelDirection {
    fn default() -> Self {
        Self::Rx
    }
}

/// Type of data transferred by channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelDataType {
    Control,
    Async,
    Sync,
    Isoc,
}

impl Default for ChannelDataType {
    fn default() -> Self {
        Self::Control
    }
}

/// The configuration of channel, fixed while the channel is started.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub direction: ChannelDirection,
    pub data_type: ChannelDataType,
    /// The number of buffer objects circulating for the channel.
    pub num_buffers: usize,
    /// The size of each buffer object in bytes.
    pub buffer_size: usize,
    /// The size of sub-buffer (block) for isochronous channel.
    pub subbuffer_size: usize,
    /// The number of packets (or frames) per transaction.
    pub packets_per_xact: usize,
}

/// Stable and opaque identifier of hardware interface.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u64);

/// The error to operate channels, buffers, and the INIC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MostError {
    /// No data or buffer is available for non-blocking operation.
    Again,
    /// The channel is not started or was torn down.
    Shutdown,
    /// The wait was interrupted and the operation should be restarted.
    Restart,
    /// The channel is claimed by extension.
    Users,
    Busy,
    Inval,
    NoDev,
    Range,
    NoEnt,
    Nxio,
    BadFd,
    NotConn,
    Io,
    NoSpace,
    NotSupported,
    Invalid(i32),
}

impl std::fmt::Display for MostError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            MostError::Again => "Again",
            MostError::Shutdown => "Shutdown",
            MostError::Restart => "Restart",
            MostError::Users => "Users",
            MostError::Busy => "Busy",
            MostError::Inval => "Inval",
            MostError::NoDev => "NoDev",
            MostError::Range => "Range",
            MostError::NoEnt => "NoEnt",
            MostError::Nxio => "Nxio",
            MostError::BadFd => "BadFd",
            MostError::NotConn => "NotConn",
            MostError::Io => "Io",
            MostError::NoSpace => "NoSpace",
            MostError::NotSupported => "NotSupported",
            MostError::Invalid(_) => "Invalid",
        };

        write!(f, "MostError::{}", label)
    }
}

impl ErrorDomain for MostError {
    fn domain() -> Quark {
        Quark::from_str("most-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            MostError::Again => 0,
            MostError::Shutdown => 1,
            MostError::Restart => 2,
            MostError::Users => 3,
            MostError::Busy => 4,
            MostError::Inval => 5,
            MostError::NoDev => 6,
            MostError::Range => 7,
            MostError::NoEnt => 8,
            MostError::Nxio => 9,
            MostError::BadFd => 10,
            MostError::NotConn => 11,
            MostError::Io => 12,
            MostError::NoSpace => 13,
            MostError::NotSupported => 14,
            MostError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => MostError::Again,
            1 => MostError::Shutdown,
            2 => MostError::Restart,
            3 => MostError::Users,
            4 => MostError::Busy,
            5 => MostError::Inval,
            6 => MostError::NoDev,
            7 => MostError::Range,
            8 => MostError::NoEnt,
            9 => MostError::Nxio,
            10 => MostError::BadFd,
            11 => MostError::NotConn,
            12 => MostError::Io,
            13 => MostError::NoSpace,
            14 => MostError::NotSupported,
            _ => MostError::Invalid(code),
        };
        Some(enumeration)
    }
}

pub(crate) fn most_error(kind: MostError, msg: &str) -> Error {
    Error::new(kind, msg)
}

/// Parse unsigned integer in text. The prefix `0x` means hexadecimal, the leading `0` means
/// octal, else decimal. Surrounding white spaces are ignored.
pub(crate) fn parse_uint(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    if digits.is_empty() || digits.starts_with('+') || digits.starts_with('-') {
        None
    } else {
        u64::from_str_radix(digits, radix).ok()
    }
}

// Poisoned locks are recovered.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read_lock<T: ?Sized>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T: ?Sized>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn wait_while<'a, T, F>(cv: &Condvar, guard: MutexGuard<'a, T>, cond: F) -> MutexGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    cv.wait_while(guard, cond)
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn wait_timeout_while<'a, T, F>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    cond: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    let (guard, res) = cv
        .wait_timeout_while(guard, timeout, cond)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    (guard, res.timed_out())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_uint_radix() {
        assert_eq!(parse_uint("0"), Some(0));
        assert_eq!(parse_uint("123\n"), Some(123));
        assert_eq!(parse_uint("0x1F"), Some(31));
        assert_eq!(parse_uint("0X1f"), Some(31));
        assert_eq!(parse_uint("017"), Some(15));
        assert_eq!(parse_uint("08"), None);
        assert_eq!(parse_uint("0x"), None);
        assert_eq!(parse_uint("-1"), None);
        assert_eq!(parse_uint("+1"), None);
        assert_eq!(parse_uint(""), None);
    }

    #[test]
    fn most_error_code() {
        [
            MostError::Again,
            MostError::Shutdown,
            MostError::Restart,
            MostError::Users,
            MostError::Busy,
            MostError::Inval,
            MostError::NoDev,
            MostError::Range,
            MostError::NoEnt,
            MostError::Nxio,
            MostError::BadFd,
            MostError::NotConn,
            MostError::Io,
            MostError::NoSpace,
            MostError::NotSupported,
        ]
        .iter()
        .for_each(|&kind| {
            let err = most_error(kind, "test");
            assert_eq!(err.kind::<MostError>(), Some(kind));
        });
    }
}
