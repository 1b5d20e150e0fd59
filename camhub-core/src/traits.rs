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

//! The contract every transport backend implements.
//!
//! The core never includes transport-specific headers; USB, V4L2, and GigE
//! Vision modules live behind these traits and are registered with the
//! capture context at load time. One [`Backend`] instance exists per
//! available transport; it hands out one [`DeviceHandle`] per opened device.

use std::sync::Arc;

use crate::error::CamhubError;
use crate::pool::{BufferPool, MemoryBuffer};
use crate::property::{PropertyDescriptor, PropertyValue};
use crate::types::{DeviceIdentity, TransportType, VideoFormat, VideoFormatDescription};

/// What a backend's acquisition path reports to the pipeline.
#[derive(Debug)]
pub enum StreamEvent {
    /// One completed frame, published from the backend's buffer lease.
    Frame(MemoryBuffer),
    /// The device is gone or the link failed mid-stream. After reporting a
    /// fault the backend must cease acquisition on its own;
    /// [`DeviceHandle::stop_stream`] stays callable and idempotent.
    Fault(CamhubError),
}

/// Invoked by the backend's acquisition thread for every stream event.
pub type StreamEventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// One loaded transport module.
///
/// Backends are `Send + Sync`: enumeration may run concurrently with open
/// devices, and the registry shares one instance across threads.
pub trait Backend: Send + Sync {
    /// The transport this backend speaks.
    fn transport(&self) -> TransportType;

    /// Lists the devices currently reachable over this transport.
    ///
    /// Fails soft: an unreachable transport reports an empty list or an
    /// error the caller downgrades to a warning, never a fatal condition.
    fn enumerate(&self) -> Result<Vec<DeviceIdentity>, CamhubError>;

    /// Opens `identity` for exclusive use.
    ///
    /// # Errors
    /// [`CamhubError::NotFound`] if the device disappeared since
    /// enumeration, [`CamhubError::Busy`] if it is already open,
    /// [`CamhubError::PermissionDenied`] on transport-level access failure.
    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceHandle>, CamhubError>;
}

/// An open device owned exclusively by its pipeline.
///
/// Dropping the handle closes the device; implementations stop a running
/// stream on drop. Property I/O may block briefly on hardware but must
/// bound the wait and surface [`CamhubError::Busy`] rather than stall.
pub trait DeviceHandle: Send {
    fn identity(&self) -> &DeviceIdentity;

    /// The device's format capability set.
    fn formats(&mut self) -> Result<Vec<VideoFormatDescription>, CamhubError>;

    /// Asks the hardware for `requested` and returns what it settled on.
    ///
    /// # Errors
    /// [`CamhubError::Unsupported`] when the device cannot produce the
    /// requested format.
    fn negotiate_format(&mut self, requested: VideoFormat) -> Result<VideoFormat, CamhubError>;

    /// Snapshot of the device's property set with live ranges and values.
    fn list_properties(&mut self) -> Result<Vec<PropertyDescriptor>, CamhubError>;

    /// Live read of one property value.
    fn property(&mut self, name: &str) -> Result<PropertyValue, CamhubError>;

    /// Writes one property value. The caller validates against the live
    /// range first and re-reads afterwards; hardware may still clamp.
    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), CamhubError>;

    /// Starts acquisition on a backend-owned thread. Frames are filled from
    /// `pool` leases and reported through `on_event`, which must be invoked
    /// for one frame at a time in capture order.
    fn start_stream(
        &mut self,
        pool: BufferPool,
        on_event: StreamEventHandler,
    ) -> Result<(), CamhubError>;

    /// Halts acquisition and joins the acquisition thread. After this
    /// returns, `on_event` is guaranteed not to fire again. Idempotent.
    fn stop_stream(&mut self) -> Result<(), CamhubError>;
}
