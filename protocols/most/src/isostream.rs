// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Extension to stream MPEG-TS over isochronous channel by video frame queue.
//!
//! The extension provides a capture device and an output device for one isochronous channel. The
//! frame size is either one block of the channel or a full buffer of blocks. The completions of
//! transmission are deferred to a worker thread.

use {
    super::{extension::*, frame::*, mbo::Mbo, *},
    std::{
        collections::VecDeque,
        sync::{mpsc, Arc, Weak},
        thread,
        time::Duration,
    },
    tracing::{debug, warn},
};

/// The default limit of memory for frames in MiB.
pub const DEFAULT_MEMORY_LIMIT_MIB: usize = 100;

/// The default number of frames.
pub const DEFAULT_FRAME_COUNT: usize = 3;

/// The fourcc of MPEG stream.
pub const PIX_FMT_MPEG: u32 = u32::from_le_bytes(*b"MPEG");

/// The direction of video device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamDirection {
    Capture,
    Output,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            StreamDirection::Capture => "in",
            StreamDirection::Output => "out",
        };
        write!(f, "{}", label)
    }
}

/// The format of video frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub sizeimage: usize,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            pixel_format: PIX_FMT_MPEG,
            sizeimage: 0,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    opened: usize,
    vbsize: usize,
    frame_size: usize,
    frame_count: usize,
    running: bool,
}

struct OutputWorker {
    tx: mpsc::SyncSender<()>,
    th: thread::JoinHandle<()>,
}

/// The video device, either for capture or output.
pub struct VideoDevice {
    name: String,
    direction: StreamDirection,
    link: ExtensionLink,
    memory_limit: usize,
    state: Mutex<DeviceState>,
    copier: Mutex<FrameCopier>,
    done: Mutex<VecDeque<Frame>>,
    done_cv: Condvar,
    worker: Mutex<Option<OutputWorker>>,
}

impl std::fmt::Debug for VideoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VideoDevice")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish()
    }
}

impl VideoDevice {
    fn new(direction: StreamDirection, link: ExtensionLink, memory_limit: usize) -> Arc<Self> {
        let name = format!("most-video-{}-{}", direction, link.minor());
        let dev = Arc::new(Self {
            name,
            direction,
            link,
            memory_limit,
            state: Default::default(),
            copier: Default::default(),
            done: Default::default(),
            done_cv: Default::default(),
            worker: Default::default(),
        });

        if direction == StreamDirection::Output {
            let (tx, rx) = mpsc::sync_channel::<()>(1);
            let weak: Weak<Self> = Arc::downgrade(&dev);
            let th = thread::spawn(move || {
                while rx.recv().is_ok() {
                    match weak.upgrade() {
                        Some(dev) => dev.tx_complete(),
                        None => break,
                    }
                }
            });
            *lock(&dev.worker) = Some(OutputWorker { tx, th });
        }

        dev
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn is_opened(&self) -> bool {
        lock(&self.state).opened > 0
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).running
    }

    /// Claim the channel for the device.
    pub fn open(&self) -> Result<(), Error> {
        self.link.lock(true)?;
        lock(&self.state).opened += 1;
        debug!(name = %self.name, "open");
        Ok(())
    }

    /// Stop streaming, free frames, then release the channel.
    pub fn release(&self) {
        self.stop_streaming();
        {
            let mut state = lock(&self.state);
            state.frame_count = 0;
            state.opened = state.opened.saturating_sub(1);
        }
        lock(&self.done).clear();
        if let Err(err) = self.link.lock(false) {
            debug!(name = %self.name, ?err, "failed to unlock");
        }
        debug!(name = %self.name, "release");
    }

    /// Decide the number and size of frames. The size is given, or decided by format, or one
    /// block of channel. It should be one block or a full buffer of blocks.
    pub fn queue_setup(&self, count: usize, size: Option<usize>) -> Result<(usize, usize), Error> {
        let geometry = self.link.geometry();
        let mut state = lock(&self.state);

        let size = match size {
            Some(size) => size,
            None if state.vbsize > 0 => state.vbsize,
            None => geometry.size,
        };
        debug!(
            name = %self.name,
            count,
            size,
            blocks = geometry.count,
            block_size = geometry.size,
            limit = self.memory_limit,
            "queue setup"
        );

        if size == 0 || (size != geometry.size && size != geometry.size * geometry.count) {
            let msg = format!("Frame size {} is neither a block nor a full buffer", size);
            Err(most_error(MostError::Inval, &msg))?;
        }

        let mut count = if count == 0 { DEFAULT_FRAME_COUNT } else { count };
        while count > 0 && size * count > self.memory_limit * 1024 * 1024 {
            count -= 1;
        }
        if count == 0 {
            let msg = format!("No room for frame of {} bytes", size);
            Err(most_error(MostError::NoSpace, &msg))?;
        }

        state.frame_size = size;
        state.frame_count = count;
        drop(state);

        lock(&self.copier).set_limit(geometry.size * geometry.count);

        Ok((count, size))
    }

    /// Allocate frames according to the last setup of queue.
    pub fn alloc_frames(&self) -> Vec<Frame> {
        let state = lock(&self.state);
        (0..state.frame_count)
            .map(|i| Frame::new(i, state.frame_size))
            .collect()
    }

    pub fn g_fmt(&self) -> VideoFormat {
        Default::default()
    }

    /// The image size is kept just when it is one block or a full buffer of blocks.
    pub fn try_fmt(&self, fmt: &VideoFormat) -> VideoFormat {
        let sizeimage = if fmt.pixel_format == PIX_FMT_MPEG {
            fmt.sizeimage
        } else {
            0
        };
        let geometry = self.link.geometry();

        let mut fmt = self.g_fmt();
        if sizeimage == geometry.size || sizeimage == geometry.size * geometry.count {
            fmt.sizeimage = sizeimage;
        }
        fmt
    }

    pub fn s_fmt(&self, fmt: &VideoFormat) -> Result<VideoFormat, Error> {
        let fmt = self.try_fmt(fmt);
        let mut state = lock(&self.state);
        if state.running || state.frame_count > 0 {
            let msg = format!("{} has frames", self.name);
            Err(most_error(MostError::Busy, &msg))
        } else {
            debug!(name = %self.name, sizeimage = fmt.sizeimage, "format");
            state.vbsize = fmt.sizeimage;
            Ok(fmt)
        }
    }

    fn complete(&self, outcome: CopyOutcome) {
        if !outcome.frames.is_empty() {
            let mut done = lock(&self.done);
            done.extend(outcome.frames);
            self.done_cv.notify_all();
        }
        outcome.buffers.into_iter().for_each(|mbo| match self.direction {
            StreamDirection::Capture => mbo.put(),
            StreamDirection::Output => mbo.submit(),
        });
    }

    // The buffer for transmission is taken before the copier is locked.
    fn take_tx_mbo(&self) -> Result<Option<Mbo>, Error> {
        match self.link.get_tx_mbo() {
            Ok(mbo) => Ok(Some(mbo)),
            Err(err) if err.kind::<MostError>() == Some(MostError::Again) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Queue the frame to be filled (capture) or to be sent (output).
    pub fn buf_queue(&self, frame: Frame) -> Result<(), Error> {
        if frame.size() == 0 {
            Err(most_error(MostError::Inval, "Frame has no buffer"))?;
        }

        let outcome = match self.direction {
            StreamDirection::Capture => {
                let mut copier = lock(&self.copier);
                copier.queue_frame(frame);
                copier.copy_to_frames()
            }
            StreamDirection::Output => {
                let mbo = self.take_tx_mbo().unwrap_or_else(|err| {
                    debug!(name = %self.name, ?err, "no buffer for transmission");
                    None
                });
                let mut copier = lock(&self.copier);
                if let Some(mbo) = mbo {
                    copier.queue_buffer(mbo);
                }
                copier.queue_frame(frame);
                copier.copy_from_frames()
            }
        };
        self.complete(outcome);

        Ok(())
    }

    pub fn start_streaming(&self) -> Result<(), Error> {
        let mbo = match self.direction {
            StreamDirection::Capture => None,
            StreamDirection::Output => self.take_tx_mbo()?,
        };

        lock(&self.state).running = true;
        debug!(name = %self.name, "start streaming");

        if let Some(mbo) = mbo {
            let outcome = {
                let mut copier = lock(&self.copier);
                copier.queue_buffer(mbo);
                copier.copy_from_frames()
            };
            self.complete(outcome);
        }

        Ok(())
    }

    /// Abort queued frames and give back any withheld buffer.
    pub fn stop_streaming(&self) {
        let (was_running, outcome) = {
            let mut copier = lock(&self.copier);
            let was_running = std::mem::replace(&mut lock(&self.state).running, false);
            (was_running, copier.drain())
        };
        if was_running || !outcome.is_empty() {
            debug!(
                name = %self.name,
                frames = outcome.frames.len(),
                buffers = outcome.buffers.len(),
                "stop streaming"
            );
        }
        let CopyOutcome { frames, buffers } = outcome;
        if !frames.is_empty() {
            lock(&self.done).extend(frames);
            self.done_cv.notify_all();
        }
        buffers.into_iter().for_each(|mbo| mbo.put());
    }

    /// Wait for frame completed or aborted. Timeout results in `MostError::Again`.
    pub fn dequeue(&self, timeout: Duration) -> Result<Frame, Error> {
        let done = lock(&self.done);
        let (mut done, _) = wait_timeout_while(&self.done_cv, done, timeout, |q| q.is_empty());
        done.pop_front().ok_or_else(|| {
            let msg = format!("No frame completed in {}", self.name);
            most_error(MostError::Again, &msg)
        })
    }

    fn rx(&self, mbo: Mbo) {
        let outcome = {
            let mut copier = lock(&self.copier);
            if !self.is_streaming() {
                drop(copier);
                mbo.put();
                return;
            }
            copier.queue_buffer(mbo);
            copier.copy_to_frames()
        };
        self.complete(outcome);
    }

    fn schedule_tx(&self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            // Pending work absorbs this request.
            let _ = worker.tx.try_send(());
        }
    }

    fn tx_complete(&self) {
        if !self.is_streaming() {
            return;
        }
        let mbo = match self.take_tx_mbo() {
            Ok(mbo) => mbo,
            Err(err) => {
                warn!(name = %self.name, ?err, "failed to get buffer for transmission");
                None
            }
        };
        let outcome = {
            let mut copier = lock(&self.copier);
            if !self.is_streaming() {
                drop(copier);
                if let Some(mbo) = mbo {
                    mbo.put();
                }
                return;
            }
            if let Some(mbo) = mbo {
                copier.queue_buffer(mbo);
            }
            copier.copy_from_frames()
        };
        self.complete(outcome);
    }
}

impl Drop for VideoDevice {
    fn drop(&mut self) {
        if let Some(OutputWorker { tx, th }) = lock(&self.worker).take() {
            drop(tx);
            // The last reference can be released by the worker itself.
            if th.thread().id() != thread::current().id() && th.join().is_err() {
                warn!(name = %self.name, "failed to join worker");
            }
        }
    }
}

/// The extension for isochronous channel with capture and output devices.
pub struct IsostreamExtension {
    memory_limit: usize,
    devices: Mutex<Option<(Arc<VideoDevice>, Arc<VideoDevice>)>>,
}

impl Default for IsostreamExtension {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT_MIB)
    }
}

impl IsostreamExtension {
    /// The limit of memory for frames is in MiB.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            memory_limit,
            devices: Default::default(),
        }
    }

    pub fn capture(&self) -> Option<Arc<VideoDevice>> {
        lock(&self.devices).as_ref().map(|(capture, _)| capture.clone())
    }

    pub fn output(&self) -> Option<Arc<VideoDevice>> {
        lock(&self.devices).as_ref().map(|(_, output)| output.clone())
    }
}

impl Extension for IsostreamExtension {
    fn setup(&self, link: &ExtensionLink) -> Result<(), Error> {
        let capture = VideoDevice::new(StreamDirection::Capture, link.clone(), self.memory_limit);
        let output = VideoDevice::new(StreamDirection::Output, link.clone(), self.memory_limit);
        debug!(capture = capture.name(), output = output.name(), "video devices");
        *lock(&self.devices) = Some((capture, output));
        Ok(())
    }

    fn rx(&self, mbo: Mbo) {
        match self.capture() {
            Some(capture) => capture.rx(mbo),
            None => mbo.put(),
        }
    }

    fn tx(&self) {
        if let Some(output) = self.output() {
            output.schedule_tx();
        }
    }

    fn cleanup(&self) {
        if let Some((capture, output)) = lock(&self.devices).clone() {
            capture.stop_streaming();
            output.stop_streaming();
        }
    }
}
