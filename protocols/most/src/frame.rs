// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Copier between a stream of transfer buffers and a queue of frames.
//!
//! A frame is a buffer sized by its consumer (one MPEG-TS block, a full buffer of blocks, or one
//! period of audio), thus it may span several transfer buffers or fill just a part of one. The
//! copier keeps byte offset into the head transfer buffer and the cursor of the head frame so
//! that copy resumes exactly at the point where it stopped.

use {
    super::mbo::Mbo,
    std::{collections::VecDeque, time::Instant},
    tracing::debug,
};

/// The state of frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameState {
    Queued,
    Done,
    /// The stream stopped before the frame was completed.
    Error,
}

impl Default for FrameState {
    fn default() -> Self {
        Self::Queued
    }
}

/// The buffer of frame.
#[derive(Debug)]
pub struct Frame {
    index: usize,
    data: Vec<u8>,
    cursor: usize,
    payload: usize,
    sequence: u32,
    state: FrameState,
    timestamp: Option<Instant>,
}

impl Frame {
    pub fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            data: vec![0; size],
            cursor: 0,
            payload: 0,
            sequence: 0,
            state: Default::default(),
            timestamp: None,
        }
    }

    /// Instantiate frame with content to transmit.
    pub fn with_content(index: usize, content: &[u8]) -> Self {
        Self {
            payload: content.len(),
            data: content.to_vec(),
            ..Self::new(index, 0)
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// The valid content of frame.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.payload]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the length of content to transmit.
    pub fn set_payload_length(&mut self, len: usize) {
        self.payload = std::cmp::min(len, self.data.len());
    }

    /// Put the frame back to the initial state for requeueing.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.state = FrameState::Queued;
        self.timestamp = None;
    }

    fn complete(&mut self, sequence: u32, state: FrameState) {
        self.sequence = sequence;
        self.state = state;
        self.timestamp = Some(Instant::now());
    }
}

/// The frames and transfer buffers released by the copier. The frames go back to their owner,
/// and the transfer buffers are released (receive) or submitted (transmit) by the caller
/// without holding any lock.
#[derive(Debug, Default)]
pub struct CopyOutcome {
    pub frames: Vec<Frame>,
    pub buffers: Vec<Mbo>,
}

impl CopyOutcome {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.buffers.is_empty()
    }
}

/// The queues of frame and transfer buffer.
#[derive(Debug, Default)]
pub struct FrameCopier {
    frames: VecDeque<Frame>,
    buffers: VecDeque<Mbo>,
    offset: usize,
    sequence: u32,
    limit: usize,
}

impl FrameCopier {
    /// The limit is the number of bytes used in each transfer buffer; zero means the whole.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn queue_frame(&mut self, mut frame: Frame) {
        frame.reset();
        self.frames.push_back(frame);
    }

    pub fn queue_buffer(&mut self, mbo: Mbo) {
        self.buffers.push_back(mbo);
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn queued_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn end_of(&self, available: usize) -> usize {
        if self.limit > 0 {
            std::cmp::min(self.limit, available)
        } else {
            available
        }
    }

    fn complete_head_frame(&mut self, outcome: &mut CopyOutcome) {
        if let Some(mut frame) = self.frames.pop_front() {
            frame.complete(self.sequence, FrameState::Done);
            self.sequence = self.sequence.wrapping_add(1);
            outcome.frames.push(frame);
        }
    }

    /// Copy received bytes to frames. The exhausted transfer buffers should be released.
    pub fn copy_to_frames(&mut self) -> CopyOutcome {
        let mut outcome = CopyOutcome::default();

        while let (Some(mbo), Some(frame)) = (self.buffers.front(), self.frames.front_mut()) {
            let end = if self.limit > 0 {
                std::cmp::min(self.limit, mbo.processed_length())
            } else {
                mbo.processed_length()
            };
            let src = &mbo.payload()[std::cmp::min(self.offset, end)..end];
            let len = std::cmp::min(src.len(), frame.data.len() - frame.cursor);
            frame.data[frame.cursor..(frame.cursor + len)].copy_from_slice(&src[..len]);
            frame.cursor += len;
            frame.payload = frame.cursor;
            self.offset += len;

            if frame.cursor >= frame.data.len() {
                self.complete_head_frame(&mut outcome);
            }

            if self.offset >= end {
                self.offset = 0;
                if let Some(mbo) = self.buffers.pop_front() {
                    outcome.buffers.push(mbo);
                }
            }
        }

        outcome
    }

    /// Copy frames to transfer buffers. The filled transfer buffers should be submitted.
    pub fn copy_from_frames(&mut self) -> CopyOutcome {
        let mut outcome = CopyOutcome::default();

        loop {
            let end = match self.buffers.front() {
                Some(mbo) => self.end_of(mbo.buffer_length()),
                None => break,
            };
            let offset = self.offset;

            let (mbo, frame) = match (self.buffers.front_mut(), self.frames.front_mut()) {
                (Some(mbo), Some(frame)) => (mbo, frame),
                _ => break,
            };
            let src = &frame.data[frame.cursor..frame.payload];
            let len = std::cmp::min(src.len(), end.saturating_sub(offset));
            mbo.data_mut()[offset..(offset + len)].copy_from_slice(&src[..len]);
            frame.cursor += len;
            self.offset += len;

            if frame.cursor >= frame.payload {
                self.complete_head_frame(&mut outcome);
            }

            if self.offset >= end {
                self.offset = 0;
                if let Some(mut mbo) = self.buffers.pop_front() {
                    let res = mbo
                        .set_processed_length(0)
                        .and_then(|_| mbo.set_buffer_length(end))
                        .and_then(|_| mbo.set_processed_length(end));
                    if let Err(err) = res {
                        debug!(end, ?err, "length of transfer buffer is not updated");
                    }
                    outcome.buffers.push(mbo);
                }
            }
        }

        outcome
    }

    /// Abort all of queued frames, and give back all of transfer buffers.
    pub fn drain(&mut self) -> CopyOutcome {
        self.offset = 0;
        let sequence = self.sequence;
        let frames = self
            .frames
            .drain(..)
            .map(|mut frame| {
                frame.complete(sequence, FrameState::Error);
                frame
            })
            .collect();
        CopyOutcome {
            frames,
            buffers: self.buffers.drain(..).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::InterfaceId};

    fn rx_buffer(content: &[u8]) -> Mbo {
        let mut mbo = Mbo::new(InterfaceId(1), 0, 256);
        mbo.set_payload(content).unwrap();
        mbo
    }

    #[test]
    fn receive_resumes_partial_frame() {
        let stream: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let mut copier = FrameCopier::new(0);
        (0..3).for_each(|i| copier.queue_frame(Frame::new(i, 100)));

        copier.queue_buffer(rx_buffer(&stream[..70]));
        copier.queue_buffer(rx_buffer(&stream[70..200]));
        copier.queue_buffer(rx_buffer(&stream[200..245]));

        let outcome = copier.copy_to_frames();
        assert_eq!(outcome.frames.len(), 2);
        assert_eq!(outcome.buffers.len(), 3);
        assert_eq!(copier.queued_frames(), 1);
        assert_eq!(copier.offset(), 0);

        let mut received: Vec<u8> = Vec::new();
        outcome.frames.iter().for_each(|frame| {
            assert_eq!(frame.state(), FrameState::Done);
            assert!(frame.timestamp().is_some());
            received.extend_from_slice(frame.payload());
        });

        copier.queue_buffer(rx_buffer(&stream[245..]));
        let outcome = copier.copy_to_frames();
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].sequence(), 2);
        received.extend_from_slice(outcome.frames[0].payload());

        assert_eq!(received, stream);
    }

    #[test]
    fn receive_stops_without_frame() {
        let stream: Vec<u8> = (0..188).map(|i| i as u8).collect();
        let mut copier = FrameCopier::new(0);
        copier.queue_frame(Frame::new(0, 100));
        copier.queue_buffer(rx_buffer(&stream));

        let outcome = copier.copy_to_frames();
        assert_eq!(outcome.frames.len(), 1);
        assert!(outcome.buffers.is_empty());
        assert_eq!(copier.offset(), 100);

        // Nothing to do.
        assert!(copier.copy_to_frames().is_empty());

        copier.queue_frame(Frame::new(1, 100));
        let outcome = copier.copy_to_frames();
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.buffers.len(), 1);
        assert_eq!(copier.offset(), 0);

        let outcome = copier.drain();
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].state(), FrameState::Error);
        assert_eq!(outcome.frames[0].payload(), &stream[100..]);
    }

    #[test]
    fn receive_with_limit() {
        let stream: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let mut copier = FrameCopier::new(150);
        copier.queue_frame(Frame::new(0, 188));
        copier.queue_buffer(rx_buffer(&stream));
        copier.queue_buffer(rx_buffer(&stream));

        let outcome = copier.copy_to_frames();
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.buffers.len(), 1);
        assert_eq!(&outcome.frames[0].payload()[..150], &stream[..150]);
        assert_eq!(&outcome.frames[0].payload()[150..], &stream[..38]);
        assert_eq!(copier.offset(), 38);
    }

    #[test]
    fn transmit_fills_buffers() {
        let stream: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let mut copier = FrameCopier::new(64);
        copier.queue_frame(Frame::with_content(0, &stream[..100]));
        copier.queue_frame(Frame::with_content(1, &stream[100..]));

        // No buffer yet.
        assert!(copier.copy_from_frames().is_empty());

        copier.queue_buffer(Mbo::new(InterfaceId(1), 1, 128));
        copier.queue_buffer(Mbo::new(InterfaceId(1), 1, 128));
        let outcome = copier.copy_from_frames();
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].index(), 0);
        assert_eq!(outcome.buffers.len(), 2);
        assert_eq!(copier.offset(), 0);

        let mut sent: Vec<u8> = Vec::new();
        outcome.buffers.iter().for_each(|mbo| {
            assert_eq!(mbo.buffer_length(), 64);
            sent.extend_from_slice(mbo.payload());
        });
        assert_eq!(sent, &stream[..128]);

        copier.queue_buffer(Mbo::new(InterfaceId(1), 1, 128));
        let outcome = copier.copy_from_frames();
        assert_eq!(outcome.frames.len(), 1);
        assert!(outcome.buffers.is_empty());
        assert_eq!(copier.offset(), 22);

        let outcome = copier.drain();
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.buffers.len(), 1);
        assert_eq!(&outcome.buffers[0].data()[..22], &stream[128..]);
    }
}
