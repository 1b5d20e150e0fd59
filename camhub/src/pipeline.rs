/*
 * Copyright 2025 The Camhub Contributors
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICEN-2.0)
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

//! The per-open-device streaming state machine.
//!
//! One [`PipelineManager`] exists per open device handle. It negotiates the
//! format, sizes the buffer pool, drives the backend's acquisition thread,
//! and fans completed frames out to registered sinks through bounded
//! per-sink queues with a drop-oldest policy. It also routes all property
//! traffic to the backend, with live-range validation and read-back
//! confirmation on every write.
//!
//! Locking discipline: one mutex around the device handle serializes every
//! public operation; a fair per-device mutex protects the state shared with
//! the acquisition callback, which takes only that lock before publishing a
//! frame. `stop()` and `close()` never hold the shared lock across the
//! acquisition join, so they are safe from any thread, concurrently with an
//! in-flight callback. Observer and sink callbacks must not call back into
//! the pipeline that invoked them.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use camhub_core::{
    BufferPool, CamhubError, DeviceHandle, DeviceIdentity, FormatRequest, MemoryBuffer,
    PoolStats, PropertyDescriptor, PropertyEvent, PropertyValue, StreamEvent,
    StreamEventHandler, VideoFormat,
};
use parking_lot::{FairMutex, Mutex};
use tracing::{debug, error, info, warn};

use crate::sink::{FrameSink, FrameSource, SinkId, SinkMessage, StopReason};

/// Where a pipeline is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Device handle is open, no format negotiated yet.
    Opened,
    /// A format is negotiated; the stream can start.
    Configured,
    /// The backend's acquisition thread is delivering frames.
    Streaming,
    /// The stream ended; re-configure and start again, or close.
    Stopped,
    /// The device handle is released. Every further operation fails.
    Closed,
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Opened => "opened",
            PipelineState::Configured => "configured",
            PipelineState::Streaming => "streaming",
            PipelineState::Stopped => "stopped",
            PipelineState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Sizing knobs for a stream. Explicit configuration, never inferred.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    /// Pool slots allocated at `start()`.
    pub buffer_count: usize,
    /// Default bound of each sink's frame queue.
    pub sink_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            buffer_count: 8,
            sink_queue_depth: 4,
        }
    }
}

/// Delivery counters for a pipeline, cumulative across restarts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames received from the backend and offered to sinks.
    pub frames_dispatched: u64,
    /// Frames evicted from sink queues by the drop-oldest policy.
    pub frames_dropped: u64,
}

/// Registration handle for one property observer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct SinkEntry {
    id: SinkId,
    tx: flume::Sender<SinkMessage>,
    rx: flume::Receiver<SinkMessage>,
    worker: Option<JoinHandle<()>>,
}

impl SinkEntry {
    /// Non-blocking enqueue with drop-oldest on a full queue. Runs on the
    /// acquisition path, so it must never wait on the consumer.
    fn push(&self, frame: MemoryBuffer, dropped: &AtomicU64) {
        if self.tx.is_full() && self.rx.try_recv().is_ok() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        if self.tx.try_send(SinkMessage::Frame(frame)).is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Discards queued frames, delivers the stop notification if the stream
    /// ran, and joins the worker.
    fn finish(mut self, reason: Option<StopReason>) {
        while let Ok(message) = self.rx.try_recv() {
            drop(message);
        }
        if let Some(reason) = reason {
            let _ = self.tx.send(SinkMessage::Stopped(reason));
        }
        drop(self.tx);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn sink_worker(rx: flume::Receiver<SinkMessage>, mut sink: Box<dyn FrameSink>) {
    while let Ok(message) = rx.recv() {
        match message {
            SinkMessage::Frame(frame) => sink.on_frame(&frame),
            SinkMessage::Stopped(reason) => {
                sink.on_stream_stopped(reason);
                return;
            }
        }
    }
}

/// State the acquisition callback shares with the pipeline's public API.
struct PipelineInner {
    state: PipelineState,
    /// Bumped on every `start()`; callbacks from a superseded stream check
    /// it and deliver nothing.
    epoch: u64,
    pool: Option<BufferPool>,
    sinks: Vec<SinkEntry>,
    next_sink_id: u64,
}

struct PipelineShared {
    identity: DeviceIdentity,
    inner: FairMutex<PipelineInner>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineShared {
    /// Device-loss path, invoked from the backend's acquisition thread.
    /// The state check makes the sink notification exactly-once.
    fn fault_stop(self: &Arc<Self>, epoch: u64, why: &CamhubError) {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.state != PipelineState::Streaming || inner.epoch != epoch {
                return;
            }
            inner.state = PipelineState::Stopped;
            inner.pool = None;
            std::mem::take(&mut inner.sinks)
        };
        error!(device = %self.identity, error = %why, "stream fault, stopping pipeline");
        for entry in entries {
            entry.finish(Some(StopReason::DeviceLost));
        }
    }
}

type Observer = Box<dyn FnMut(&PropertyEvent) + Send>;

/// State only touched by public operations, under the handle lock.
struct ControlState {
    config: StreamConfig,
    format: Option<VideoFormat>,
    property_cache: Option<Vec<PropertyDescriptor>>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer_id: u64,
}

/// Orchestrates the open → configure → stream → stop lifecycle of one open
/// device. Created by [`CaptureDevice::open`](crate::CaptureDevice::open);
/// dropping it closes the device.
pub struct PipelineManager {
    shared: Arc<PipelineShared>,
    handle: Mutex<Option<Box<dyn DeviceHandle>>>,
    control: Mutex<ControlState>,
}

impl PipelineManager {
    pub(crate) fn new(handle: Box<dyn DeviceHandle>) -> Self {
        let identity = handle.identity().clone();
        PipelineManager {
            shared: Arc::new(PipelineShared {
                identity,
                inner: FairMutex::new(PipelineInner {
                    state: PipelineState::Opened,
                    epoch: 0,
                    pool: None,
                    sinks: Vec::new(),
                    next_sink_id: 0,
                }),
                dispatched: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            handle: Mutex::new(Some(handle)),
            control: Mutex::new(ControlState {
                config: StreamConfig::default(),
                format: None,
                property_cache: None,
                observers: Vec::new(),
                next_observer_id: 0,
            }),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.shared.inner.lock().state
    }

    /// The negotiated format, once `configure` has succeeded.
    #[must_use]
    pub fn format(&self) -> Option<VideoFormat> {
        self.control.lock().format
    }

    /// Replaces the stream sizing configuration. Rejected while streaming;
    /// the pool is never resized under an active stream.
    pub fn set_stream_config(&self, config: StreamConfig) -> Result<(), CamhubError> {
        let guard = self.handle.lock();
        if guard.is_none() {
            return Err(CamhubError::invalid_state(
                "set stream config",
                PipelineState::Closed,
            ));
        }
        let state = self.shared.inner.lock().state;
        if state == PipelineState::Streaming {
            return Err(CamhubError::invalid_state("set stream config", state));
        }
        self.control.lock().config = config;
        Ok(())
    }

    /// The device's format capability set.
    pub fn formats(&self) -> Result<Vec<camhub_core::VideoFormatDescription>, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "list formats")?;
        handle.formats()
    }

    /// Negotiates `requested` with the device.
    ///
    /// Valid from `Opened`, `Configured`, and `Stopped`. On
    /// [`CamhubError::Unsupported`] the state is left unchanged.
    pub fn configure(&self, requested: VideoFormat) -> Result<VideoFormat, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "configure")?;
        self.check_configurable()?;
        let negotiated = handle.negotiate_format(requested)?;
        self.control.lock().format = Some(negotiated);
        self.shared.inner.lock().state = PipelineState::Configured;
        info!(device = %self.shared.identity, format = %negotiated, "format configured");
        Ok(negotiated)
    }

    /// Resolves `request` against the device's capability set, then
    /// negotiates the result.
    pub fn configure_with(&self, request: &FormatRequest) -> Result<VideoFormat, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "configure")?;
        self.check_configurable()?;
        let descriptions = handle.formats()?;
        let requested = request.fulfill(&descriptions).ok_or_else(|| {
            CamhubError::Unsupported(format!("no device capability satisfies {request:?}"))
        })?;
        let negotiated = handle.negotiate_format(requested)?;
        self.control.lock().format = Some(negotiated);
        self.shared.inner.lock().state = PipelineState::Configured;
        info!(device = %self.shared.identity, format = %negotiated, "format configured");
        Ok(negotiated)
    }

    /// Starts streaming. Allocates the pool for the negotiated format and
    /// hands the backend the pipeline's event handler. Idempotent while
    /// already streaming.
    pub fn start(&self) -> Result<(), CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "start")?;
        {
            let inner = self.shared.inner.lock();
            match inner.state {
                PipelineState::Streaming => return Ok(()),
                PipelineState::Configured => {}
                other => return Err(CamhubError::invalid_state("start", other)),
            }
        }
        let (format, buffer_count) = {
            let control = self.control.lock();
            let format = control
                .format
                .ok_or_else(|| CamhubError::invalid_state("start", "unconfigured"))?;
            (format, control.config.buffer_count)
        };

        let pool = BufferPool::new(format, buffer_count);
        let epoch = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.pool = Some(pool.clone());
            inner.state = PipelineState::Streaming;
            inner.epoch
        };

        if let Err(why) = handle.start_stream(pool, self.event_handler(epoch)) {
            let mut inner = self.shared.inner.lock();
            inner.state = PipelineState::Configured;
            inner.pool = None;
            return Err(why);
        }
        info!(device = %self.shared.identity, format = %format, "stream started");
        Ok(())
    }

    /// Stops streaming. Safe and idempotent from any thread and any state;
    /// once it returns, no sink receives anything for this stream and every
    /// sink has been notified exactly once.
    pub fn stop(&self) -> Result<(), CamhubError> {
        let mut guard = self.handle.lock();
        self.stop_with_guard(&mut guard)
    }

    /// Closes the device, stopping the stream first if needed. All further
    /// operations fail with an invalid-state error. Idempotent.
    pub fn close(&self) -> Result<(), CamhubError> {
        let mut guard = self.handle.lock();
        if guard.is_none() {
            return Ok(());
        }
        // A failed backend stop still leaves the device closed; the error is
        // reported after teardown completes.
        let stop_result = self.stop_with_guard(&mut guard);
        let entries = {
            let mut inner = self.shared.inner.lock();
            inner.state = PipelineState::Closed;
            inner.pool = None;
            std::mem::take(&mut inner.sinks)
        };
        // Sinks registered outside a stream never saw it run; detach them
        // without a stop notification.
        for entry in entries {
            entry.finish(None);
        }
        {
            let mut control = self.control.lock();
            control.observers.clear();
            control.property_cache = None;
        }
        *guard = None;
        info!(device = %self.shared.identity, "device closed");
        stop_result
    }

    /// Registers a sink with the default queue depth.
    pub fn add_sink(&self, sink: impl FrameSink + 'static) -> Result<SinkId, CamhubError> {
        let depth = self.control.lock().config.sink_queue_depth;
        self.add_sink_with_depth(sink, depth)
    }

    /// Registers a sink with an explicit bounded queue depth. Valid in any
    /// non-closed state, concurrently with streaming.
    pub fn add_sink_with_depth(
        &self,
        sink: impl FrameSink + 'static,
        depth: usize,
    ) -> Result<SinkId, CamhubError> {
        let (tx, rx) = flume::bounded(depth.max(1));
        let worker_rx = rx.clone();
        let sink: Box<dyn FrameSink> = Box::new(sink);

        let mut inner = self.shared.inner.lock();
        if inner.state == PipelineState::Closed {
            return Err(CamhubError::invalid_state("add sink", PipelineState::Closed));
        }
        let id = SinkId(inner.next_sink_id);
        inner.next_sink_id += 1;
        let worker = std::thread::spawn(move || sink_worker(worker_rx, sink));
        inner.sinks.push(SinkEntry {
            id,
            tx,
            rx,
            worker: Some(worker),
        });
        debug!(device = %self.shared.identity, sink = id.0, "sink registered");
        Ok(id)
    }

    /// Detaches a sink. Its queued frames are discarded; no stop
    /// notification is delivered, since the stream did not stop.
    pub fn remove_sink(&self, id: SinkId) -> Result<(), CamhubError> {
        let entry = {
            let mut inner = self.shared.inner.lock();
            if inner.state == PipelineState::Closed {
                return Err(CamhubError::invalid_state(
                    "remove sink",
                    PipelineState::Closed,
                ));
            }
            let position = inner
                .sinks
                .iter()
                .position(|entry| entry.id == id)
                .ok_or_else(|| CamhubError::NotFound(format!("sink {id:?}")))?;
            inner.sinks.remove(position)
        };
        entry.finish(None);
        debug!(device = %self.shared.identity, sink = id.0, "sink removed");
        Ok(())
    }

    /// Registers a pull consumer with the default queue depth.
    pub fn frame_source(&self) -> Result<FrameSource, CamhubError> {
        let depth = self.control.lock().config.sink_queue_depth;
        self.frame_source_with_depth(depth)
    }

    /// Registers a pull consumer backed by a bounded queue of `depth`
    /// frames. Drop-oldest applies when the application falls behind.
    pub fn frame_source_with_depth(&self, depth: usize) -> Result<FrameSource, CamhubError> {
        let (tx, rx) = flume::bounded(depth.max(1));
        let mut inner = self.shared.inner.lock();
        if inner.state == PipelineState::Closed {
            return Err(CamhubError::invalid_state(
                "add frame source",
                PipelineState::Closed,
            ));
        }
        let id = SinkId(inner.next_sink_id);
        inner.next_sink_id += 1;
        inner.sinks.push(SinkEntry {
            id,
            tx,
            rx: rx.clone(),
            worker: None,
        });
        Ok(FrameSource::new(rx, id))
    }

    /// Descriptor snapshot of the device's property set. Values may be
    /// stale when hardware auto-adjusts; [`refresh_properties`]
    /// (Self::refresh_properties) forces a live re-list.
    pub fn properties(&self) -> Result<Vec<PropertyDescriptor>, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "list properties")?;
        let mut control = self.control.lock();
        if let Some(cached) = &control.property_cache {
            return Ok(cached.clone());
        }
        let properties = handle.list_properties()?;
        control.property_cache = Some(properties.clone());
        Ok(properties)
    }

    /// Re-reads the property set from the device, replacing the snapshot.
    pub fn refresh_properties(&self) -> Result<Vec<PropertyDescriptor>, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "refresh properties")?;
        let properties = handle.list_properties()?;
        self.control.lock().property_cache = Some(properties.clone());
        Ok(properties)
    }

    /// Live read of one property value.
    pub fn property(&self, name: &str) -> Result<PropertyValue, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "read property")?;
        handle.property(name)
    }

    /// Writes a property and returns the hardware-confirmed value.
    ///
    /// The write is validated against the property's live range and flags
    /// first; hardware may still clamp silently, so the value of record is
    /// the read-back after the write, never the request. Every successful
    /// write broadcasts a [`PropertyEvent`] with a fresh descriptor
    /// snapshot to all registered observers, synchronously, so
    /// interdependent range and writability shifts reach them at once.
    pub fn set_property(
        &self,
        name: &str,
        value: &PropertyValue,
    ) -> Result<PropertyValue, CamhubError> {
        let mut guard = self.handle.lock();
        let handle = Self::open_handle(&mut guard, "write property")?;

        // Ranges shift at runtime; validate against a live descriptor.
        let descriptors = handle.list_properties()?;
        let descriptor = descriptors
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| CamhubError::NotFound(format!("property `{name}`")))?;
        let flags = descriptor.flags();
        if !flags.writable {
            return Err(CamhubError::NotWritable(name.to_string()));
        }
        if flags.locked_while_streaming
            && self.shared.inner.lock().state == PipelineState::Streaming
        {
            return Err(CamhubError::NotWritable(name.to_string()));
        }
        if let Err(reason) = descriptor.range().validate(value) {
            return Err(CamhubError::InvalidValue {
                property: name.to_string(),
                value: value.to_string(),
                reason,
            });
        }

        handle.set_property(name, value)?;
        let confirmed = handle.property(name)?;
        if confirmed != *value {
            debug!(
                device = %self.shared.identity,
                property = name,
                requested = %value,
                confirmed = %confirmed,
                "hardware clamped property write"
            );
        }
        let properties = handle.list_properties()?;

        let mut control = self.control.lock();
        control.property_cache = Some(properties.clone());
        let event = PropertyEvent {
            name: name.to_string(),
            value: confirmed.clone(),
            properties,
        };
        for (_, observer) in control.observers.iter_mut() {
            observer(&event);
        }
        Ok(confirmed)
    }

    /// Registers an observer for property-set changes. The callback runs
    /// synchronously inside every successful [`set_property`]
    /// (Self::set_property) on this pipeline.
    pub fn observe_properties(
        &self,
        observer: impl FnMut(&PropertyEvent) + Send + 'static,
    ) -> Result<ObserverId, CamhubError> {
        let guard = self.handle.lock();
        if guard.is_none() {
            return Err(CamhubError::invalid_state(
                "observe properties",
                PipelineState::Closed,
            ));
        }
        let mut control = self.control.lock();
        let id = ObserverId(control.next_observer_id);
        control.next_observer_id += 1;
        control.observers.push((id, Box::new(observer)));
        Ok(id)
    }

    pub fn unobserve_properties(&self, id: ObserverId) -> Result<(), CamhubError> {
        let _guard = self.handle.lock();
        let mut control = self.control.lock();
        let position = control
            .observers
            .iter()
            .position(|(observer_id, _)| *observer_id == id)
            .ok_or_else(|| CamhubError::NotFound(format!("observer {id:?}")))?;
        control.observers.remove(position);
        Ok(())
    }

    /// Delivery counters, readable from any thread without blocking.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            frames_dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Occupancy of the active stream's buffer pool, if one is streaming.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.shared.inner.lock().pool.as_ref().map(BufferPool::stats)
    }

    fn open_handle<'a>(
        guard: &'a mut Option<Box<dyn DeviceHandle>>,
        operation: &str,
    ) -> Result<&'a mut Box<dyn DeviceHandle>, CamhubError> {
        guard
            .as_mut()
            .ok_or_else(|| CamhubError::invalid_state(operation, PipelineState::Closed))
    }

    fn check_configurable(&self) -> Result<(), CamhubError> {
        let state = self.shared.inner.lock().state;
        match state {
            PipelineState::Opened | PipelineState::Configured | PipelineState::Stopped => Ok(()),
            other => Err(CamhubError::invalid_state("configure", other)),
        }
    }

    fn event_handler(&self, epoch: u64) -> StreamEventHandler {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |event| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match event {
                StreamEvent::Frame(frame) => {
                    let inner = shared.inner.lock();
                    if inner.state != PipelineState::Streaming || inner.epoch != epoch {
                        // Late callback from a stopped stream: the frame
                        // goes straight back to the pool.
                        return;
                    }
                    shared.dispatched.fetch_add(1, Ordering::Relaxed);
                    for entry in &inner.sinks {
                        entry.push(frame.clone(), &shared.dropped);
                    }
                }
                StreamEvent::Fault(why) => shared.fault_stop(epoch, &why),
            }
        })
    }

    /// The shared stop path. Takes the sink entries and pool out under the
    /// shared lock, quiesces the backend *without* holding it, then tears
    /// the sinks down. The lock ordering keeps the acquisition callback
    /// free to complete while we wait for the join.
    fn stop_with_guard(
        &self,
        guard: &mut Option<Box<dyn DeviceHandle>>,
    ) -> Result<(), CamhubError> {
        let entries = {
            let mut inner = self.shared.inner.lock();
            if inner.state != PipelineState::Streaming {
                return Ok(());
            }
            inner.state = PipelineState::Stopped;
            inner.pool = None;
            std::mem::take(&mut inner.sinks)
        };
        let stop_result = match guard.as_mut() {
            Some(handle) => handle.stop_stream(),
            None => Ok(()),
        };
        if let Err(why) = &stop_result {
            warn!(device = %self.shared.identity, error = %why, "backend stop reported an error");
        }
        for entry in entries {
            entry.finish(Some(StopReason::Requested));
        }
        info!(device = %self.shared.identity, "stream stopped");
        stop_result
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineManager")
            .field("identity", &self.shared.identity)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimulatedBackend, SimulatedDeviceSpec};
    use camhub_core::property::wellknown;
    use camhub_core::{Backend, PixelEncoding};
    use std::time::Duration;

    fn fast_format() -> VideoFormat {
        VideoFormat::new(PixelEncoding::Mono8, 160, 120, 120)
    }

    fn open_pipeline(spec: SimulatedDeviceSpec) -> PipelineManager {
        let backend = SimulatedBackend::new().with_device(spec);
        let identity = backend.enumerate().unwrap().remove(0);
        PipelineManager::new(backend.open(&identity).unwrap())
    }

    fn open_default() -> PipelineManager {
        open_pipeline(SimulatedDeviceSpec::new("sim-0", "Simulated Camera", "SN-1"))
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    /// Counts frames and stop notifications into shared vectors.
    struct RecordingSink {
        frames: Arc<Mutex<Vec<u64>>>,
        stops: Arc<Mutex<Vec<StopReason>>>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Vec<u64>>>, Arc<Mutex<Vec<StopReason>>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let stops = Arc::new(Mutex::new(Vec::new()));
            (
                RecordingSink {
                    frames: Arc::clone(&frames),
                    stops: Arc::clone(&stops),
                },
                frames,
                stops,
            )
        }
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, frame: &MemoryBuffer) {
            self.frames.lock().push(frame.frame_id());
        }

        fn on_stream_stopped(&mut self, reason: StopReason) {
            self.stops.lock().push(reason);
        }
    }

    #[test]
    fn lifecycle_walks_the_state_machine() {
        let pipeline = open_default();
        assert_eq!(pipeline.state(), PipelineState::Opened);

        pipeline.configure(fast_format()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Configured);

        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Streaming);

        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        pipeline.close().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    #[test]
    fn unsupported_format_leaves_state_unchanged() {
        let pipeline = open_default();
        let result = pipeline.configure(VideoFormat::new(PixelEncoding::Mono8, 1920, 1080, 30));
        assert!(matches!(result, Err(CamhubError::Unsupported(_))));
        assert_eq!(pipeline.state(), PipelineState::Opened);
        assert_eq!(pipeline.format(), None);
    }

    #[test]
    fn start_requires_a_configured_format() {
        let pipeline = open_default();
        assert!(matches!(
            pipeline.start(),
            Err(CamhubError::InvalidState { .. })
        ));
    }

    #[test]
    fn start_is_idempotent_while_streaming() {
        let pipeline = open_default();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.start().is_ok());
        assert_eq!(pipeline.state(), PipelineState::Streaming);
        pipeline.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_safe_in_any_state() {
        let pipeline = open_default();
        assert!(pipeline.stop().is_ok());
        pipeline.configure(fast_format()).unwrap();
        assert!(pipeline.stop().is_ok());
        pipeline.start().unwrap();
        assert!(pipeline.stop().is_ok());
        assert!(pipeline.stop().is_ok());
    }

    #[test]
    fn operations_on_a_closed_pipeline_fail_cleanly() {
        let pipeline = open_default();
        pipeline.close().unwrap();
        assert!(matches!(
            pipeline.configure(fast_format()),
            Err(CamhubError::InvalidState { .. })
        ));
        assert!(matches!(
            pipeline.properties(),
            Err(CamhubError::InvalidState { .. })
        ));
        assert!(matches!(
            pipeline.property(wellknown::GAIN),
            Err(CamhubError::InvalidState { .. })
        ));
        assert!(pipeline.close().is_ok());
    }

    #[test]
    fn restart_after_stop_renegotiates_cleanly() {
        let pipeline = open_default();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        pipeline.stop().unwrap();

        let other = VideoFormat::new(PixelEncoding::Mono8, 640, 480, 60);
        pipeline.configure(other).unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Streaming);
        assert_eq!(pipeline.format(), Some(other));
        pipeline.stop().unwrap();
    }

    #[test]
    fn sinks_receive_frames_in_increasing_order() {
        let pipeline = open_default();
        let (sink, frames, stops) = RecordingSink::new();
        pipeline.add_sink(sink).unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || frames.lock().len() >= 5));
        pipeline.stop().unwrap();

        let ids = frames.lock().clone();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {ids:?}");
        assert_eq!(stops.lock().clone(), vec![StopReason::Requested]);
    }

    #[test]
    fn no_delivery_after_stop_returns() {
        let pipeline = open_default();
        let (sink, frames, stops) = RecordingSink::new();
        pipeline.add_sink(sink).unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !frames.lock().is_empty()));

        pipeline.stop().unwrap();
        let count_at_stop = frames.lock().len();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(frames.lock().len(), count_at_stop);
        assert_eq!(stops.lock().clone(), vec![StopReason::Requested]);
    }

    #[test]
    fn stop_from_another_thread_quiesces_delivery() {
        let pipeline = Arc::new(open_default());
        let (sink, frames, _stops) = RecordingSink::new();
        pipeline.add_sink(sink).unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !frames.lock().is_empty()));

        let stopper = {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || pipeline.stop())
        };
        stopper.join().unwrap().unwrap();

        let count_at_stop = frames.lock().len();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(frames.lock().len(), count_at_stop);
    }

    #[test]
    fn stalled_sink_does_not_starve_the_others() {
        let pipeline = open_default();
        let depth = 4;
        // A source nobody drains stands in for a stuck consumer.
        let _stalled = pipeline.frame_source_with_depth(depth).unwrap();
        let (sink, frames, _stops) = RecordingSink::new();
        pipeline.add_sink_with_depth(sink, depth).unwrap();

        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();

        let target = depth * 10;
        assert!(
            wait_until(Duration::from_secs(10), || frames.lock().len() >= target),
            "healthy sink starved: got {} of {target}",
            frames.lock().len()
        );
        let stats = pipeline.stats();
        assert!(stats.frames_dispatched >= target as u64);
        assert!(stats.frames_dropped > 0, "stalled queue never dropped");
        pipeline.stop().unwrap();
    }

    #[test]
    fn buffer_count_is_conserved_while_streaming() {
        let pipeline = open_default();
        let mut source = pipeline.frame_source_with_depth(4).unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();

        for _ in 0..20 {
            let _ = source.try_recv();
            let stats = pipeline.pool_stats().expect("pool while streaming");
            assert_eq!(
                stats.idle + stats.leased + stats.published,
                stats.capacity
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.stop().unwrap();
    }

    #[test]
    fn frame_source_drains_and_reports_stop() {
        let pipeline = open_default();
        let mut source = pipeline.frame_source().unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();

        let frame = source.recv().expect("a frame while streaming");
        assert!(frame.copy_to_bytes().is_ok() || frame.is_stale());

        pipeline.stop().unwrap();
        while source.recv().is_some() {}
        assert_eq!(source.stop_reason(), Some(StopReason::Requested));
    }

    #[test]
    fn device_loss_stops_the_pipeline_and_notifies_once() {
        let pipeline = open_pipeline(
            SimulatedDeviceSpec::new("sim-0", "Simulated Camera", "SN-1").fail_after_frames(3),
        );
        let (sink, frames, stops) = RecordingSink::new();
        pipeline.add_sink(sink).unwrap();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            pipeline.state() == PipelineState::Stopped
        }));
        assert!(wait_until(Duration::from_secs(2), || !stops.lock().is_empty()));
        assert_eq!(stops.lock().clone(), vec![StopReason::DeviceLost]);
        assert!(frames.lock().len() <= 3);

        // Explicit stop after the fault stays an Ok no-op.
        assert!(pipeline.stop().is_ok());
        assert_eq!(stops.lock().len(), 1);
    }

    #[test]
    fn set_property_returns_the_confirmed_value() {
        let pipeline = open_default();
        let confirmed = pipeline
            .set_property(wellknown::BRIGHTNESS, &PropertyValue::Integer(37))
            .unwrap();
        // Hardware snaps to the step grid; the read-back is the value of record.
        assert_eq!(confirmed, PropertyValue::Integer(32));
        assert_eq!(
            pipeline.property(wellknown::BRIGHTNESS).unwrap(),
            confirmed
        );
    }

    #[test]
    fn set_property_validates_against_the_live_range() {
        let pipeline = open_default();
        assert!(matches!(
            pipeline.set_property(wellknown::BRIGHTNESS, &PropertyValue::Integer(4096)),
            Err(CamhubError::InvalidValue { .. })
        ));
        assert!(matches!(
            pipeline.set_property(wellknown::BRIGHTNESS, &PropertyValue::Float(12.0)),
            Err(CamhubError::InvalidValue { .. })
        ));
        assert!(matches!(
            pipeline.set_property("NoSuchKnob", &PropertyValue::Integer(1)),
            Err(CamhubError::NotFound(_))
        ));
        // Rejected writes leave the value untouched.
        assert_eq!(
            pipeline.property(wellknown::BRIGHTNESS).unwrap(),
            PropertyValue::Integer(128)
        );
    }

    #[test]
    fn auto_exposure_toggle_reaches_observers_with_shifted_flags() {
        let pipeline = open_default();
        let events: Arc<Mutex<Vec<PropertyEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        pipeline
            .observe_properties(move |event| events_clone.lock().push(event.clone()))
            .unwrap();

        pipeline
            .set_property(wellknown::AUTO_EXPOSURE, &PropertyValue::Boolean(true))
            .unwrap();

        // The broadcast is synchronous: the event is already here.
        let seen = events.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, wellknown::AUTO_EXPOSURE);
        assert_eq!(seen[0].value, PropertyValue::Boolean(true));
        let exposure = seen[0]
            .properties
            .iter()
            .find(|d| d.name() == wellknown::EXPOSURE_TIME)
            .unwrap();
        assert!(!exposure.flags().writable);

        // Manual exposure writes now surface NotWritable.
        assert!(matches!(
            pipeline.set_property(wellknown::EXPOSURE_TIME, &PropertyValue::Float(500.0)),
            Err(CamhubError::NotWritable(_))
        ));
    }

    #[test]
    fn unobserve_stops_the_broadcast() {
        let pipeline = open_default();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let id = pipeline
            .observe_properties(move |event| events_clone.lock().push(event.name.clone()))
            .unwrap();
        pipeline.unobserve_properties(id).unwrap();
        pipeline
            .set_property(wellknown::GAIN, &PropertyValue::Float(6.0))
            .unwrap();
        assert!(events.lock().is_empty());
        assert!(pipeline.unobserve_properties(id).is_err());
    }

    #[test]
    fn streaming_locked_property_rejects_writes_while_streaming() {
        let pipeline = open_default();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.set_property(
                wellknown::TRIGGER_MODE,
                &PropertyValue::Enumeration("Software".to_string())
            ),
            Err(CamhubError::NotWritable(_))
        ));
        pipeline.stop().unwrap();
        assert!(pipeline
            .set_property(
                wellknown::TRIGGER_MODE,
                &PropertyValue::Enumeration("Software".to_string())
            )
            .is_ok());
    }

    #[test]
    fn properties_snapshot_is_cached_until_refreshed() {
        let pipeline = open_default();
        let before = pipeline.properties().unwrap();
        pipeline
            .set_property(wellknown::GAIN, &PropertyValue::Float(12.0))
            .unwrap();
        // The write refreshed the snapshot through its own re-list.
        let after = pipeline.properties().unwrap();
        assert_ne!(before, after);
        let refreshed = pipeline.refresh_properties().unwrap();
        assert_eq!(after, refreshed);
    }

    #[test]
    fn stream_config_is_rejected_mid_stream() {
        let pipeline = open_default();
        pipeline.configure(fast_format()).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.set_stream_config(StreamConfig {
                buffer_count: 16,
                sink_queue_depth: 8
            }),
            Err(CamhubError::InvalidState { .. })
        ));
        pipeline.stop().unwrap();
        assert!(pipeline
            .set_stream_config(StreamConfig {
                buffer_count: 16,
                sink_queue_depth: 8
            })
            .is_ok());
    }
}
