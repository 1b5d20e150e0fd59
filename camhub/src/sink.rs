/*
 * Copyright 2025 The Camhub Contributors
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Consumer-facing ends of the pipeline.
//!
//! A [`FrameSink`] is a push consumer: its callback runs on a dedicated
//! worker thread fed by a bounded queue, so a slow sink only ever loses its
//! own frames. A [`FrameSource`] is the pull flavor: the pipeline feeds the
//! same bounded queue and the application drains it at its own pace.

use std::fmt::{self, Display, Formatter};

use camhub_core::MemoryBuffer;

/// Why a stream ended, delivered to every sink exactly once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The application called `stop()` or `close()`.
    Requested,
    /// The device vanished mid-stream (unplug, link loss, timeout).
    DeviceLost,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "requested"),
            StopReason::DeviceLost => write!(f, "device lost"),
        }
    }
}

/// Registration handle for one sink, returned by `add_sink`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SinkId(pub(crate) u64);

/// A registered consumer of delivered frames.
///
/// Frames arrive in strictly increasing frame-id order. The sink must not
/// retain the [`MemoryBuffer`] past its callback; copy the payload out with
/// [`MemoryBuffer::copy_to_bytes`] to keep it.
pub trait FrameSink: Send {
    /// One delivered frame. Runs on the sink's worker thread; taking too
    /// long here fills the sink's bounded queue and drops its oldest frames,
    /// never anyone else's.
    fn on_frame(&mut self, frame: &MemoryBuffer);

    /// The stream ended. Called exactly once per started stream, after the
    /// last `on_frame` for it.
    fn on_stream_stopped(&mut self, reason: StopReason);
}

#[derive(Debug)]
pub(crate) enum SinkMessage {
    Frame(MemoryBuffer),
    Stopped(StopReason),
}

/// Receiver-backed frame consumer, created with
/// [`PipelineManager::frame_source`](crate::PipelineManager::frame_source).
///
/// Shares the bounded-queue semantics of a registered sink: if the
/// application falls behind, the oldest queued frames are dropped. Once the
/// stream stops, `recv` returns `None` and
/// [`stop_reason`](Self::stop_reason) reports why.
pub struct FrameSource {
    rx: flume::Receiver<SinkMessage>,
    id: SinkId,
    stopped: Option<StopReason>,
}

impl FrameSource {
    pub(crate) fn new(rx: flume::Receiver<SinkMessage>, id: SinkId) -> Self {
        FrameSource {
            rx,
            id,
            stopped: None,
        }
    }

    /// The sink registration backing this source, usable with
    /// `remove_sink` to detach it early.
    #[must_use]
    pub fn sink_id(&self) -> SinkId {
        self.id
    }

    /// Blocks for the next frame. Returns `None` once the stream has
    /// stopped or the pipeline is gone.
    pub fn recv(&mut self) -> Option<MemoryBuffer> {
        if self.stopped.is_some() {
            return None;
        }
        match self.rx.recv() {
            Ok(SinkMessage::Frame(frame)) => Some(frame),
            Ok(SinkMessage::Stopped(reason)) => {
                self.stopped = Some(reason);
                None
            }
            Err(_) => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv): `None` also when no
    /// frame is queued right now.
    pub fn try_recv(&mut self) -> Option<MemoryBuffer> {
        if self.stopped.is_some() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(SinkMessage::Frame(frame)) => Some(frame),
            Ok(SinkMessage::Stopped(reason)) => {
                self.stopped = Some(reason);
                None
            }
            Err(_) => None,
        }
    }

    /// Why the stream stopped, once it has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Blocking iterator over incoming frames, ending when the stream stops.
    pub fn iter(&mut self) -> impl Iterator<Item = MemoryBuffer> + '_ {
        std::iter::from_fn(move || self.recv())
    }
}
