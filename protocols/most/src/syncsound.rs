// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Extension to transfer PCM frames over synchronous channel.
//!
//! The extension emulates a PCM substream with a ring buffer. Captured frames are copied into
//! the ring buffer at every received buffer object. Playback frames are copied from the ring
//! buffer by a thread paced by the completions of transmission. The channel address is fixed for
//! each minor.

use {
    super::{extension::*, mbo::Mbo, mlb150::*, *},
    std::{
        sync::{Arc, Weak},
        thread,
    },
    tracing::{debug, error},
};

/// The maximum size of period in bytes.
pub const MAX_PERIOD_SIZE: usize = 8192;
/// The minimum size of period in bytes.
pub const MIN_PERIOD_SIZE: usize = 128;

pub const MIN_CHANNELS: usize = 1;
pub const MAX_CHANNELS: usize = 6;

/// The channel address for each minor; transmit slot in higher 16 bits.
pub const SYNC_CHANNEL_ADDRESSES: [u32; MLB_MAX_SYNC_DEVICES] = [
    (8 << 16) | 7,
    (10 << 16) | 9,
    (12 << 16) | 11,
    (14 << 16) | 13,
    (16 << 16) | 15,
    (18 << 16) | 17,
    // Shared with the second one.
    (10 << 16) | 9,
];

/// The channel address for the minor.
pub fn channel_address(minor: usize) -> Result<u32, Error> {
    SYNC_CHANNEL_ADDRESSES.get(minor).copied().ok_or_else(|| {
        let msg = format!("No channel address for sync{}", minor);
        most_error(MostError::NotConn, &msg)
    })
}

/// The format of PCM sample.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S16Be,
    S24_3Le,
    S24_3Be,
}

impl SampleFormat {
    pub fn physical_width(&self) -> usize {
        match self {
            SampleFormat::S16Le | SampleFormat::S16Be => 16,
            SampleFormat::S24_3Le | SampleFormat::S24_3Be => 24,
        }
    }

    pub fn is_big_endian(&self) -> bool {
        match self {
            SampleFormat::S16Be | SampleFormat::S24_3Be => true,
            SampleFormat::S16Le | SampleFormat::S24_3Le => false,
        }
    }
}

/// The routine to copy samples between the ring buffer and buffer object. The samples are in
/// big endian on the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyRoutine {
    Memcpy,
    Swap16,
    Swap24,
}

impl CopyRoutine {
    pub fn select(format: SampleFormat) -> Option<Self> {
        if format.is_big_endian() || format.physical_width() == 8 {
            Some(CopyRoutine::Memcpy)
        } else {
            match format.physical_width() {
                16 => Some(CopyRoutine::Swap16),
                24 => Some(CopyRoutine::Swap24),
                _ => None,
            }
        }
    }

    pub fn copy(&self, dst: &mut [u8], src: &[u8]) {
        let len = std::cmp::min(dst.len(), src.len());
        let (dst, src) = (&mut dst[..len], &src[..len]);
        match self {
            CopyRoutine::Memcpy => dst.copy_from_slice(src),
            CopyRoutine::Swap16 => dst
                .chunks_exact_mut(2)
                .zip(src.chunks_exact(2))
                .for_each(|(d, s)| {
                    d[0] = s[1];
                    d[1] = s[0];
                }),
            CopyRoutine::Swap24 => dst
                .chunks_exact_mut(3)
                .zip(src.chunks_exact(3))
                .for_each(|(d, s)| {
                    d[0] = s[2];
                    d[1] = s[1];
                    d[2] = s[0];
                }),
        }
    }
}

/// The parameters of PCM substream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PcmParams {
    pub channels: usize,
    pub format: SampleFormat,
    /// The number of frames in a period.
    pub period_frames: usize,
    /// The number of periods in the ring buffer.
    pub periods: usize,
}

impl PcmParams {
    pub fn frame_bytes(&self) -> usize {
        self.channels * self.format.physical_width() / 8
    }

    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.frame_bytes()
    }

    pub fn buffer_frames(&self) -> usize {
        self.period_frames * self.periods
    }
}

#[derive(Default)]
struct PcmState {
    direction: Option<ChannelDirection>,
    params: Option<PcmParams>,
    mode: Option<SyncStartupMode>,
    ring: Vec<u8>,
    buffer_pos: usize,
    period_pos: usize,
    copy: Option<CopyRoutine>,
    running: bool,
    started: bool,
    // Incremented at every chance of transmission.
    kicks: u64,
    stop: bool,
}

impl PcmState {
    // Copy frames between the ring buffer and the area of buffer object, then advance positions.
    // Returns true when a period elapsed.
    fn copy_data(&mut self, area: &mut [u8], frames: usize, to_ring: bool) -> bool {
        let (params, copy) = match (self.params, self.copy) {
            (Some(params), Some(copy)) => (params, copy),
            _ => return false,
        };
        let frame_bytes = params.frame_bytes();
        let buffer_frames = params.buffer_frames();
        if frame_bytes == 0 || buffer_frames == 0 {
            return false;
        }

        let frames = std::cmp::min(frames, area.len() / frame_bytes);
        let mut done = 0;
        while done < frames {
            // Wrap around at the end of ring buffer.
            let count = std::cmp::min(buffer_frames - self.buffer_pos, frames - done);
            let ring_range = (self.buffer_pos * frame_bytes)..((self.buffer_pos + count) * frame_bytes);
            let area_range = (done * frame_bytes)..((done + count) * frame_bytes);
            if to_ring {
                copy.copy(&mut self.ring[ring_range], &area[area_range]);
            } else {
                copy.copy(&mut area[area_range], &self.ring[ring_range]);
            }
            done += count;
            self.buffer_pos = (self.buffer_pos + count) % buffer_frames;
        }

        self.period_pos += frames;
        if self.period_pos >= params.period_frames {
            self.period_pos %= params.period_frames;
            true
        } else {
            false
        }
    }
}

type PeriodCallback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    link: Mutex<Option<ExtensionLink>>,
    state: Mutex<PcmState>,
    cv: Condvar,
    callback: Mutex<Option<PeriodCallback>>,
}

impl Shared {
    fn link(&self) -> Result<ExtensionLink, Error> {
        lock(&self.link)
            .clone()
            .ok_or_else(|| most_error(MostError::NoDev, "Extension is not registered"))
    }

    fn period_elapsed(&self) {
        if let Some(cb) = lock(&self.callback).as_ref() {
            cb();
        }
    }

    fn kick(&self) {
        let mut state = lock(&self.state);
        state.kicks += 1;
        self.cv.notify_all();
    }
}

fn playback_thread(shared: Weak<Shared>) {
    let mut kicks = 0;
    loop {
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };
        {
            let state = lock(&shared.state);
            let state = wait_while(&shared.cv, state, |s| !s.stop && !(s.running && s.kicks != kicks));
            if state.stop {
                break;
            }
            kicks = state.kicks;
        }

        let link = match shared.link() {
            Ok(link) => link,
            Err(_) => continue,
        };

        while let Ok(mut mbo) = link.get_tx_mbo() {
            let elapsed = {
                let mut state = lock(&shared.state);
                if state.running {
                    let frame_bytes = state.params.map(|p| p.frame_bytes()).unwrap_or(0);
                    let frames = if frame_bytes > 0 {
                        mbo.buffer_length() / frame_bytes
                    } else {
                        0
                    };
                    state.copy_data(mbo.data_mut(), frames, false)
                } else {
                    mbo.data_mut().iter_mut().for_each(|b| *b = 0);
                    false
                }
            };
            let length = mbo.buffer_length();
            if let Err(err) = mbo.set_processed_length(length) {
                debug!(length, ?err, "processed length is not updated");
            }
            mbo.submit();
            if elapsed {
                shared.period_elapsed();
            }
        }
    }
}

/// The extension for synchronous channel with PCM ring buffer.
pub struct SyncSoundExtension {
    shared: Arc<Shared>,
    // Serialize PCM operations. Never taken in callbacks.
    ops: Mutex<()>,
    playback: Mutex<Option<thread::JoinHandle<()>>>,
    buffer_size: Mutex<Option<usize>>,
}

impl Default for SyncSoundExtension {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                link: Default::default(),
                state: Default::default(),
                cv: Default::default(),
                callback: Default::default(),
            }),
            ops: Default::default(),
            playback: Default::default(),
            buffer_size: Default::default(),
        }
    }
}

impl std::fmt::Debug for SyncSoundExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SyncSoundExtension")
            .field("link", &*lock(&self.shared.link))
            .finish()
    }
}

impl SyncSoundExtension {
    /// Set the callback for period elapsed.
    pub fn set_period_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.shared.callback) = Some(Box::new(cb));
    }

    /// The limit of period size; `-1` means the default.
    pub fn buffer_size_show(&self) -> String {
        match *lock(&self.buffer_size) {
            Some(size) => format!("{} ", size),
            None => "-1 ".to_string(),
        }
    }

    pub fn buffer_size_store(&self, text: &str) -> Result<(), Error> {
        let text = text.trim();
        let size = if text == "-1" {
            None
        } else {
            let size = parse_uint(text).ok_or_else(|| {
                let msg = format!("Invalid buffer size: {}", text);
                most_error(MostError::Inval, &msg)
            })?;
            Some(size as usize)
        };
        *lock(&self.buffer_size) = size;
        Ok(())
    }

    /// Open the substream for the direction.
    pub fn open(&self, direction: ChannelDirection) -> Result<(), Error> {
        let _ops = lock(&self.ops);

        if lock(&self.shared.state).direction.is_some() {
            Err(most_error(MostError::Busy, "Substream is already opened"))?;
        }

        let link = self.shared.link()?;
        let caddr = channel_address(link.minor())?;
        link.lock(true)?;
        if let Err(err) = link.set_address(caddr) {
            if let Err(e) = link.lock(false) {
                debug!(minor = link.minor(), err = ?e, "failed to unlock");
            }
            return Err(err);
        }

        debug!(minor = link.minor(), ?direction, caddr, "open substream");

        let mut state = lock(&self.shared.state);
        *state = PcmState {
            direction: Some(direction),
            kicks: state.kicks,
            ..Default::default()
        };

        Ok(())
    }

    fn period_bytes_range(&self) -> (usize, usize) {
        match *lock(&self.buffer_size) {
            Some(size) => (size, size),
            None => (MIN_PERIOD_SIZE, MAX_PERIOD_SIZE),
        }
    }

    /// Decide the layout of frame and allocate the ring buffer.
    pub fn hw_params(&self, params: &PcmParams) -> Result<(), Error> {
        let _ops = lock(&self.ops);

        let direction = lock(&self.shared.state)
            .direction
            .ok_or_else(|| most_error(MostError::BadFd, "Substream is not opened"))?;

        if params.channels < MIN_CHANNELS || params.channels > MAX_CHANNELS {
            let msg = format!("Requested number of channels not supported: {}", params.channels);
            Err(most_error(MostError::Inval, &msg))?;
        }

        let mode = SyncStartupMode::from_layout(
            params.channels,
            params.format.physical_width() / 8,
            direction,
        )
        .ok_or_else(|| {
            let msg = format!("No startup mode for {:?}", params);
            most_error(MostError::Inval, &msg)
        })?;

        let (min, max) = self.period_bytes_range();
        let period_bytes = params.period_bytes();
        if period_bytes < min || period_bytes > max || params.periods == 0 {
            let msg = format!(
                "Period of {} bytes out of range {}..={}",
                period_bytes, min, max
            );
            Err(most_error(MostError::Inval, &msg))?;
        }

        debug!(
            channels = params.channels,
            format = ?params.format,
            period_bytes,
            buffer_bytes = period_bytes * params.periods,
            ?mode,
            "hw params"
        );

        let mut state = lock(&self.shared.state);
        state.params = Some(*params);
        state.mode = Some(mode);
        state.ring = vec![0; period_bytes * params.periods];

        Ok(())
    }

    /// Start the channel. Playback is started by a thread paced by transmission.
    pub fn prepare(&self) -> Result<(), Error> {
        let _ops = lock(&self.ops);

        let (direction, params, mode) = {
            let state = lock(&self.shared.state);
            let direction = state
                .direction
                .ok_or_else(|| most_error(MostError::Nxio, "Substream is not opened"))?;
            if state.started {
                if direction == ChannelDirection::Tx {
                    // Recovery from underrun.
                    return Ok(());
                } else {
                    Err(most_error(MostError::Busy, "Substream is already started"))?;
                }
            }
            match (state.params, state.mode) {
                (Some(params), Some(mode)) => (direction, params, mode),
                _ => Err(most_error(MostError::Inval, "Parameters are not decided"))?,
            }
        };

        let copy = CopyRoutine::select(params.format).ok_or_else(|| {
            error!(format = ?params.format, "unsupported format");
            most_error(MostError::Inval, "Unsupported format")
        })?;

        {
            let mut state = lock(&self.shared.state);
            state.copy = Some(copy);
            state.buffer_pos = 0;
            state.period_pos = 0;
            state.stop = false;
        }

        let access = match direction {
            ChannelDirection::Rx => AccessMode::ReadOnly,
            ChannelDirection::Tx => AccessMode::WriteOnly,
        };
        let link = self.shared.link()?;
        link.sync_startup(access, mode)?;

        if direction == ChannelDirection::Tx {
            let shared = Arc::downgrade(&self.shared);
            *lock(&self.playback) = Some(thread::spawn(move || playback_thread(shared)));
        }

        lock(&self.shared.state).started = true;
        debug!(?direction, ?copy, "prepared");

        Ok(())
    }

    pub fn trigger(&self, start: bool) {
        debug!(start, "trigger");
        let mut state = lock(&self.shared.state);
        state.running = start;
        if start {
            state.kicks += 1;
        }
        self.shared.cv.notify_all();
    }

    /// The position in the ring buffer in frames.
    pub fn pointer(&self) -> usize {
        lock(&self.shared.state).buffer_pos
    }

    /// Write frames to the ring buffer for playback.
    pub fn ring_write(&self, frame_offset: usize, data: &[u8]) -> Result<(), Error> {
        let mut state = lock(&self.shared.state);
        let frame_bytes = state.params.map(|p| p.frame_bytes()).unwrap_or(0);
        let start = frame_offset * frame_bytes;
        let end = start + data.len();
        if frame_bytes == 0 || end > state.ring.len() {
            let msg = format!("Area {}..{} out of ring buffer", start, end);
            Err(most_error(MostError::Range, &msg))?;
        }
        state.ring[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Read frames from the ring buffer for capture.
    pub fn ring_read(&self, frame_offset: usize, frames: usize) -> Result<Vec<u8>, Error> {
        let state = lock(&self.shared.state);
        let frame_bytes = state.params.map(|p| p.frame_bytes()).unwrap_or(0);
        let start = frame_offset * frame_bytes;
        let end = start + frames * frame_bytes;
        if frame_bytes == 0 || end > state.ring.len() {
            let msg = format!("Area {}..{} out of ring buffer", start, end);
            Err(most_error(MostError::Range, &msg))?;
        }
        Ok(state.ring[start..end].to_vec())
    }

    fn stop_playback(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.stop = true;
            self.shared.cv.notify_all();
        }
        if let Some(th) = lock(&self.playback).take() {
            if th.join().is_err() {
                error!("failed to join playback thread");
            }
        }
    }

    /// Stop the channel, then release it.
    pub fn close(&self) -> Result<(), Error> {
        let _ops = lock(&self.ops);

        let (direction, started) = {
            let state = lock(&self.shared.state);
            (state.direction, state.started)
        };
        if direction.is_none() {
            Err(most_error(MostError::BadFd, "Substream is not opened"))?;
        }

        self.stop_playback();

        let link = self.shared.link()?;
        if started {
            if let Err(err) = link.shutdown() {
                debug!(?err, "channel already stopped");
            }
        }
        link.lock(false)?;

        let mut state = lock(&self.shared.state);
        *state = PcmState {
            kicks: state.kicks,
            ..Default::default()
        };
        debug!(minor = link.minor(), "closed");

        Ok(())
    }
}

impl Drop for SyncSoundExtension {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

impl Extension for SyncSoundExtension {
    fn setup(&self, link: &ExtensionLink) -> Result<(), Error> {
        channel_address(link.minor())?;
        *lock(&self.shared.link) = Some(link.clone());
        Ok(())
    }

    fn rx(&self, mut mbo: Mbo) {
        let elapsed = {
            let mut state = lock(&self.shared.state);
            let frame_bytes = state.params.map(|p| p.frame_bytes()).unwrap_or(0);
            if state.running && frame_bytes > 0 {
                let frames = mbo.processed_length() / frame_bytes;
                let length = mbo.processed_length();
                state.copy_data(&mut mbo.data_mut()[..length], frames, true)
            } else {
                false
            }
        };
        mbo.put();
        if elapsed {
            self.shared.period_elapsed();
        }
    }

    fn tx(&self) {
        self.shared.kick();
    }

    fn cleanup(&self) {
        let mut state = lock(&self.shared.state);
        state.started = false;
        state.running = false;
        self.shared.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use {
        super::{
            super::mbo::{loopback::*, MostInterface},
            *,
        },
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::{Duration, Instant},
        },
    };

    const RX_CH: usize = 0;
    const TX_CH: usize = 1;

    fn setup() -> (Arc<Mlb150>, Arc<LoopbackInterface>) {
        let mlb = Mlb150::new(Default::default()).unwrap();
        let iface = LoopbackInterface::new(0x77);
        iface.add_channel(RX_CH, 4, 256);
        iface.add_channel(TX_CH, 2, 128);

        [(RX_CH, ChannelDirection::Rx, "9"), (TX_CH, ChannelDirection::Tx, "10")]
            .iter()
            .for_each(|&(ch, direction, name)| {
                let cfg = ChannelConfig {
                    direction,
                    data_type: ChannelDataType::Sync,
                    num_buffers: 4,
                    ..Default::default()
                };
                mlb.probe_channel(iface.clone(), ch, cfg, name).unwrap();
            });

        (mlb, iface)
    }

    #[test]
    fn copy_routines() {
        assert_eq!(CopyRoutine::select(SampleFormat::S16Be), Some(CopyRoutine::Memcpy));
        assert_eq!(CopyRoutine::select(SampleFormat::S24_3Be), Some(CopyRoutine::Memcpy));
        assert_eq!(CopyRoutine::select(SampleFormat::S16Le), Some(CopyRoutine::Swap16));
        assert_eq!(CopyRoutine::select(SampleFormat::S24_3Le), Some(CopyRoutine::Swap24));

        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0; 6];
        CopyRoutine::Swap16.copy(&mut dst, &src);
        assert_eq!(dst, [2, 1, 4, 3, 6, 5]);
        CopyRoutine::Swap24.copy(&mut dst, &src);
        assert_eq!(dst, [3, 2, 1, 6, 5, 4]);
        CopyRoutine::Memcpy.copy(&mut dst, &src);
        assert_eq!(dst, src);

        assert!(channel_address(6).is_ok());
        let err = channel_address(7).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NotConn));
    }

    #[test]
    fn capture_ring_wraps() {
        let (mlb, iface) = setup();
        let ext = Arc::new(SyncSoundExtension::default());
        let _link = mlb
            .register_extension(ExtensionClass::Sync, 1, ext.clone())
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        ext.set_period_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ext.open(ChannelDirection::Rx).unwrap();
        let err = ext.open(ChannelDirection::Rx).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));

        let mut params = PcmParams {
            channels: 3,
            format: SampleFormat::S16Le,
            period_frames: 32,
            periods: 2,
        };
        let err = ext.hw_params(&params).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Inval));
        params.channels = 7;
        assert!(ext.hw_params(&params).is_err());
        params.channels = 2;
        params.period_frames = 16;
        assert!(ext.hw_params(&params).is_err());
        params.period_frames = 32;
        ext.hw_params(&params).unwrap();

        ext.prepare().unwrap();
        let err = ext.prepare().unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::Busy));
        let cfg = iface.started_config(RX_CH).unwrap();
        assert_eq!(cfg.subbuffer_size, 4);

        // Not running.
        mlb.rx_completion(iface.rx_buffer(RX_CH, &[0xff; 160]).unwrap())
            .unwrap();
        assert_eq!(ext.pointer(), 0);

        ext.trigger(true);
        let stream: Vec<u8> = (0..320).map(|i| i as u8).collect();
        mlb.rx_completion(iface.rx_buffer(RX_CH, &stream[..160]).unwrap())
            .unwrap();
        assert_eq!(ext.pointer(), 40);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        mlb.rx_completion(iface.rx_buffer(RX_CH, &stream[160..]).unwrap())
            .unwrap();
        assert_eq!(ext.pointer(), 16);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(iface.outstanding(RX_CH), 0);

        let mut expected = vec![0; 320];
        CopyRoutine::Swap16.copy(&mut expected, &stream);
        assert_eq!(ext.ring_read(0, 16).unwrap(), &expected[256..]);
        assert_eq!(ext.ring_read(16, 48).unwrap(), &expected[64..256]);
        assert!(ext.ring_read(60, 8).is_err());

        ext.close().unwrap();
        assert!(!iface.is_started(RX_CH));
        let err = ext.close().unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::BadFd));

        // Available again.
        ext.open(ChannelDirection::Rx).unwrap();
        ext.close().unwrap();
    }

    #[test]
    fn playback_paced_by_transmission() {
        let (mlb, iface) = setup();
        let ext = Arc::new(SyncSoundExtension::default());
        let _link = mlb
            .register_extension(ExtensionClass::Sync, 1, ext.clone())
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        ext.set_period_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ext.open(ChannelDirection::Tx).unwrap();
        let params = PcmParams {
            channels: 1,
            format: SampleFormat::S16Be,
            period_frames: 64,
            periods: 2,
        };
        ext.hw_params(&params).unwrap();

        let ring: Vec<u8> = (0..256).map(|i| i as u8).collect();
        ext.ring_write(0, &ring).unwrap();
        assert!(ext.ring_write(1, &ring).is_err());

        ext.prepare().unwrap();
        // Recovery from underrun.
        ext.prepare().unwrap();
        let cfg = iface.started_config(TX_CH).unwrap();
        assert_eq!(cfg.subbuffer_size, 2);

        ext.trigger(true);

        let mut submitted = Vec::new();
        let start = Instant::now();
        while submitted.len() < 2 || count.load(Ordering::SeqCst) < 2 {
            assert!(start.elapsed() < Duration::from_secs(5));
            submitted.append(&mut iface.take_submitted());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(submitted[0].payload(), &ring[..128]);
        assert_eq!(submitted[1].payload(), &ring[128..]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(ext.pointer(), 0);

        ext.trigger(false);
        submitted.into_iter().for_each(|mbo| mbo.put());
        mlb.tx_completion(iface.id(), TX_CH).unwrap();

        ext.close().unwrap();
        assert!(!iface.is_started(TX_CH));
        assert_eq!(iface.outstanding(TX_CH), 0);
    }

    #[test]
    fn buffer_size_attribute() {
        let ext = SyncSoundExtension::default();
        assert_eq!(ext.buffer_size_show(), "-1 ");
        ext.buffer_size_store("0x400\n").unwrap();
        assert_eq!(ext.buffer_size_show(), "1024 ");
        assert!(ext.buffer_size_store("abc").is_err());
        ext.buffer_size_store("-1").unwrap();
        assert_eq!(ext.buffer_size_show(), "-1 ");

        // Not registered.
        let err = ext.open(ChannelDirection::Rx).unwrap_err();
        assert_eq!(err.kind::<MostError>(), Some(MostError::NoDev));
    }
}
