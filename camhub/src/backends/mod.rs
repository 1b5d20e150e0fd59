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

//! In-tree transport backends.
//!
//! Each backend implements [`Backend`](camhub_core::Backend) and registers
//! with the [`CaptureContext`](crate::CaptureContext); transport-specific
//! code never leaks past this module. Hardware backends are feature-gated so
//! the crate builds everywhere; the simulated backend is always available.

pub mod simulated;

#[cfg(all(feature = "backend-v4l2", target_os = "linux"))]
pub mod v4l2;
