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

//! One capture layer for heterogeneous cameras.
//!
//! `camhub` presents USB, V4L2, and GigE Vision cameras through a single
//! device catalog, a single streaming pipeline, and a single typed property
//! API. Transport backends plug in behind the [`Backend`] trait; everything
//! above it is transport-agnostic.
//!
//! ```no_run
//! use camhub::{CaptureContext, FormatRequest, PixelEncoding};
//!
//! # fn main() -> Result<(), camhub::CamhubError> {
//! let context = CaptureContext::with_native_backends();
//! let index = context.device_index();
//! index.refresh();
//!
//! let device = index.list().into_iter().next().expect("a camera");
//! let pipeline = device.open()?;
//! pipeline.configure_with(&FormatRequest::HighestResolution(PixelEncoding::Yuyv))?;
//!
//! let mut frames = pipeline.frame_source()?;
//! pipeline.start()?;
//! for frame in frames.iter().take(10) {
//!     println!("frame {} ({} bytes)", frame.frame_id(), frame.len());
//! }
//! pipeline.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod device;
pub mod index;
pub mod pipeline;
pub mod registry;
pub mod sink;

pub use camhub_core::{
    Backend, BufferLease, BufferPool, CamhubError, DeviceHandle, DeviceIdentity, FormatRequest,
    MemoryBuffer, PixelEncoding, PoolStats, PropertyDescriptor, PropertyEvent, PropertyFlags,
    PropertyRange, PropertyValue, StreamEvent, StreamEventHandler, TransportPriority,
    TransportType, VideoFormat, VideoFormatDescription,
};
pub use camhub_core::property::wellknown;

pub use device::CaptureDevice;
pub use index::DeviceIndex;
pub use pipeline::{ObserverId, PipelineManager, PipelineState, StreamConfig, StreamStats};
pub use registry::CaptureContext;
pub use sink::{FrameSink, FrameSource, SinkId, StopReason};
