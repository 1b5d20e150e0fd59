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

//! Core type definitions for `camhub`: device identity and video formats,
//! the typed property model, the pooled frame buffer, and the contract
//! transport backends implement.
//!
//! This crate carries no logging and no transport code; the orchestration
//! layer lives in the `camhub` crate.

pub mod error;
pub mod pool;
pub mod property;
pub mod traits;
pub mod types;

pub use error::CamhubError;
pub use pool::{BufferLease, BufferPool, MemoryBuffer, PoolStats};
pub use property::{
    PropertyDescriptor, PropertyEvent, PropertyFlags, PropertyRange, PropertyValue,
};
pub use traits::{Backend, DeviceHandle, StreamEvent, StreamEventHandler};
pub use types::{
    DeviceIdentity, FormatRequest, PixelEncoding, TransportPriority, TransportType, VideoFormat,
    VideoFormatDescription,
};
