// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Data path of aim channel with blocking I/O.
//!
//! The received buffer objects are queued to a bounded FIFO and read by byte stream. The
//! transmitted bytes are accumulated to a buffer object cached in the same FIFO, then submitted.
//! The lock order is the I/O lock, then the FIFO lock. Completions take the FIFO lock only.

use {
    super::{extension::ExtLock, mbo::*, *},
    nix::poll::PollFlags,
    std::{collections::VecDeque, sync::Arc},
    tracing::debug,
};

/// The counters of channel.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub rx_drops: u64,
    pub tx_drops: u64,
}

impl std::fmt::Display for ChannelStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.rx_bytes, self.tx_bytes, self.rx_pkts, self.tx_pkts, self.rx_drops, self.tx_drops
        )
    }
}

pub(crate) struct Binding {
    pub(crate) slot: usize,
    pub(crate) iface: Arc<dyn MostInterface>,
    pub(crate) channel_id: usize,
    pub(crate) cfg: ChannelConfig,
}

/// The state guarded by I/O lock. The channel is started while bound.
#[derive(Default)]
pub(crate) struct AimIo {
    pub(crate) binding: Option<Binding>,
    pub(crate) caddr: u32,
    pub(crate) mbo_offs: usize,
    pub(crate) users: usize,
    pub(crate) sync_buf_size: usize,
}

#[derive(Default)]
struct Fifo {
    queue: VecDeque<Mbo>,
    capacity: usize,
    bound: bool,
    // Incremented at every binding and unbinding.
    epoch: u64,
    interrupts: u64,
}

pub(crate) struct AimChannel {
    pub(crate) name: String,
    pub(crate) data_type: ChannelDataType,
    pub(crate) io: Mutex<AimIo>,
    pub(crate) ext: ExtLock,
    fifo: Mutex<Fifo>,
    wq: Condvar,
    stats: RwLock<ChannelStats>,
}

fn not_started(name: &str) -> Error {
    let msg = format!("{} is not started", name);
    most_error(MostError::Shutdown, &msg)
}

impl AimChannel {
    pub(crate) fn new(name: String, data_type: ChannelDataType, sync_buf_size: usize) -> Self {
        Self {
            name,
            data_type,
            io: Mutex::new(AimIo {
                sync_buf_size,
                ..Default::default()
            }),
            ext: Default::default(),
            fifo: Default::default(),
            wq: Default::default(),
            stats: Default::default(),
        }
    }

    fn check_io(&self, io: &AimIo) -> Result<(), Error> {
        if io.binding.is_none() {
            Err(not_started(&self.name))
        } else if self.ext.is_locked() {
            let msg = format!("{} is locked by extension", self.name);
            Err(most_error(MostError::Users, &msg))
        } else {
            Ok(())
        }
    }

    // Decide the result of blocking wait from the state of FIFO at wakeup.
    fn check_wakeup(&self, bound: bool, rebound: bool, interrupted: bool) -> Result<(), Error> {
        if interrupted {
            let msg = format!("Wait for {} is interrupted", self.name);
            Err(most_error(MostError::Restart, &msg))
        } else if !bound {
            Err(not_started(&self.name))
        } else if rebound {
            let msg = format!("{} is started again while waiting", self.name);
            Err(most_error(MostError::Restart, &msg))
        } else {
            Ok(())
        }
    }

    pub(crate) fn read(&self, dst: &mut [u8], nonblock: bool) -> Result<usize, Error> {
        let mut io = lock(&self.io);
        loop {
            self.check_io(&io)?;

            let mut fifo = lock(&self.fifo);
            if let Some(mbo) = fifo.queue.front() {
                let offs = io.mbo_offs;
                let avail = mbo.processed_length().saturating_sub(offs);
                let len = std::cmp::min(avail, dst.len());
                dst[..len].copy_from_slice(&mbo.payload()[offs..(offs + len)]);
                io.mbo_offs += len;

                let released = if io.mbo_offs >= mbo.processed_length() {
                    io.mbo_offs = 0;
                    fifo.queue.pop_front()
                } else {
                    None
                };
                drop(fifo);

                {
                    let mut stats = write_lock(&self.stats);
                    stats.rx_bytes += len as u64;
                    if released.is_some() {
                        stats.rx_pkts += 1;
                    }
                }

                if let Some(mbo) = released {
                    mbo.put();
                }

                break Ok(len);
            }

            if nonblock {
                let msg = format!("No data available in {}", self.name);
                break Err(most_error(MostError::Again, &msg));
            }

            let epoch = fifo.epoch;
            let interrupts = fifo.interrupts;
            drop(io);

            let fifo = wait_while(&self.wq, fifo, |f| {
                f.queue.is_empty() && f.bound && f.epoch == epoch && f.interrupts == interrupts
            });
            let res = self.check_wakeup(fifo.bound, fifo.epoch != epoch, fifo.interrupts != interrupts);
            drop(fifo);
            res?;

            io = lock(&self.io);
        }
    }

    pub(crate) fn write(&self, src: &[u8], nonblock: bool) -> Result<usize, Error> {
        let mut io = lock(&self.io);
        loop {
            self.check_io(&io)?;

            if src.is_empty() {
                break Ok(0);
            }

            let (iface, channel_id, cfg) = match &io.binding {
                Some(binding) => (binding.iface.clone(), binding.channel_id, binding.cfg),
                None => break Err(not_started(&self.name)),
            };

            let mut fifo = lock(&self.fifo);
            if fifo.queue.is_empty() {
                if let Some(mbo) = iface.get_mbo(channel_id) {
                    fifo.queue.push_back(mbo);
                }
            }

            if let Some(mbo) = fifo.queue.front_mut() {
                let offs = io.mbo_offs;
                let limit = if cfg.buffer_size > 0 {
                    std::cmp::min(cfg.buffer_size, mbo.buffer_length())
                } else {
                    mbo.buffer_length()
                };
                let len = std::cmp::min(src.len(), limit.saturating_sub(offs));
                mbo.data_mut()[offs..(offs + len)].copy_from_slice(&src[..len]);
                io.mbo_offs += len;

                let complete = io.mbo_offs >= limit
                    || cfg.data_type == ChannelDataType::Control
                    || cfg.data_type == ChannelDataType::Async;

                let submitted = if complete {
                    let length = io.mbo_offs;
                    io.mbo_offs = 0;
                    fifo.queue.pop_front().map(|mut mbo| {
                        if let Err(err) = mbo.set_buffer_length(length) {
                            debug!(name = %self.name, length, ?err, "buffer length is not updated");
                        }
                        mbo
                    })
                } else {
                    None
                };
                drop(fifo);

                if let Some(mbo) = submitted {
                    {
                        let mut stats = write_lock(&self.stats);
                        stats.tx_bytes += mbo.buffer_length() as u64;
                        stats.tx_pkts += 1;
                    }
                    mbo.submit();
                }

                break Ok(len);
            }

            if nonblock {
                let msg = format!("No buffer available in {}", self.name);
                break Err(most_error(MostError::Again, &msg));
            }

            let epoch = fifo.epoch;
            let interrupts = fifo.interrupts;
            drop(io);

            let fifo = wait_while(&self.wq, fifo, |f| {
                f.queue.is_empty()
                    && f.bound
                    && f.epoch == epoch
                    && f.interrupts == interrupts
                    && !iface.has_mbo(channel_id)
            });
            let res = self.check_wakeup(fifo.bound, fifo.epoch != epoch, fifo.interrupts != interrupts);
            drop(fifo);
            res?;

            io = lock(&self.io);
        }
    }

    pub(crate) fn poll(&self) -> PollFlags {
        let io = lock(&self.io);
        let binding = match &io.binding {
            Some(binding) => binding,
            None => {
                return PollFlags::POLLIN
                    | PollFlags::POLLOUT
                    | PollFlags::POLLERR
                    | PollFlags::POLLNVAL
                    | PollFlags::POLLHUP;
            }
        };

        if self.ext.is_locked() {
            return PollFlags::empty();
        }

        let fifo = lock(&self.fifo);
        match binding.cfg.direction {
            ChannelDirection::Rx => {
                if !fifo.queue.is_empty() {
                    PollFlags::POLLIN | PollFlags::POLLRDNORM
                } else {
                    PollFlags::empty()
                }
            }
            ChannelDirection::Tx => {
                if !fifo.queue.is_empty() || binding.iface.has_mbo(binding.channel_id) {
                    PollFlags::POLLOUT | PollFlags::POLLWRNORM
                } else {
                    PollFlags::empty()
                }
            }
        }
    }

    /// Queue the received buffer object, or drop it when the FIFO is full.
    pub(crate) fn enqueue_rx(&self, mbo: Mbo) {
        let mut fifo = lock(&self.fifo);
        if fifo.bound && fifo.queue.len() < fifo.capacity {
            fifo.queue.push_back(mbo);
            self.wq.notify_all();
        } else {
            drop(fifo);
            debug!(name = %self.name, "drop received buffer object");
            write_lock(&self.stats).rx_drops += 1;
            mbo.put();
        }
    }

    pub(crate) fn wake_writers(&self) {
        let _fifo = lock(&self.fifo);
        self.wq.notify_all();
    }

    /// Wake up any blocked reader or writer. They return with `MostError::Restart`.
    pub(crate) fn interrupt_waiters(&self) {
        let mut fifo = lock(&self.fifo);
        fifo.interrupts += 1;
        self.wq.notify_all();
    }

    /// Bind the FIFO to the channel with the given depth.
    pub(crate) fn bind_fifo(&self, io: &mut AimIo, capacity: usize) {
        io.mbo_offs = 0;
        let mut fifo = lock(&self.fifo);
        fifo.capacity = capacity;
        fifo.bound = true;
        fifo.epoch += 1;
    }

    /// Unbind the FIFO, wake any waiter, then release all of queued buffer objects.
    pub(crate) fn unbind_fifo(&self, io: &mut AimIo) {
        let drained: Vec<Mbo> = {
            let mut fifo = lock(&self.fifo);
            fifo.bound = false;
            fifo.epoch += 1;
            self.wq.notify_all();
            fifo.queue.drain(..).collect()
        };

        let partial_tx = io.mbo_offs > 0
            && io
                .binding
                .as_ref()
                .map(|binding| binding.cfg.direction == ChannelDirection::Tx)
                .unwrap_or(false);
        if partial_tx {
            write_lock(&self.stats).tx_drops += 1;
        }
        io.mbo_offs = 0;

        drained.into_iter().for_each(|mbo| mbo.put());
    }

    pub(crate) fn queued(&self) -> usize {
        lock(&self.fifo).queue.len()
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        *read_lock(&self.stats)
    }

    pub(crate) fn stat_line(&self) -> String {
        format!("{}\n", self.stats())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stats_format() {
        let stats = ChannelStats {
            rx_bytes: 1,
            tx_bytes: 22,
            rx_pkts: 333,
            tx_pkts: 4,
            rx_drops: 0,
            tx_drops: 5,
        };
        assert_eq!(stats.to_string(), "1 22 333 4 0 5");
    }

    #[test]
    fn unbound_channel_refuses_io() {
        let aim = AimChannel::new("sync0".to_string(), ChannelDataType::Sync, 0);
        let mut buf = [0; 4];
        let err = aim.read(&mut buf, false).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Shutdown));
        let err = aim.write(&buf, true).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Shutdown));
        assert!(aim.poll().contains(PollFlags::POLLHUP));
        assert_eq!(aim.stat_line(), "0 0 0 0 0 0\n");
    }
}
