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

//! The backend registry and loader.
//!
//! A [`CaptureContext`] owns one [`Backend`] instance per available
//! transport. It is an explicit, process-scoped object rather than a global:
//! create it once at startup, hand it to a [`DeviceIndex`], and drop it
//! after the last device is closed. Backend unavailability at load time is a
//! warning, never a fatal error; partial availability is the expected state
//! on most hosts.

use std::collections::BTreeMap;
use std::sync::Arc;

use camhub_core::{Backend, TransportType};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::index::DeviceIndex;

/// Process-scoped registry mapping transport type to its loaded backend.
pub struct CaptureContext {
    backends: RwLock<BTreeMap<TransportType, Arc<dyn Backend>>>,
}

impl CaptureContext {
    /// An empty context. Register backends with [`register`](Self::register).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureContext {
            backends: RwLock::new(BTreeMap::new()),
        })
    }

    /// Probes every transport compiled into this build and registers the
    /// ones whose native dependencies are actually present on this host.
    /// A transport that fails to initialize is skipped with a warning.
    #[must_use]
    pub fn with_native_backends() -> Arc<Self> {
        let context = CaptureContext::new();

        #[cfg(all(feature = "backend-v4l2", target_os = "linux"))]
        match crate::backends::v4l2::V4l2Backend::probe() {
            Ok(backend) => context.register(Arc::new(backend)),
            Err(why) => warn!(
                transport = %TransportType::V4l2,
                error = %why,
                "skipping unavailable backend"
            ),
        }

        context
    }

    /// Registers `backend` for its transport. Out-of-tree transports plug in
    /// here. Registering a second backend for the same transport replaces
    /// the first.
    pub fn register(&self, backend: Arc<dyn Backend>) {
        let transport = backend.transport();
        let replaced = self.backends.write().insert(transport, backend).is_some();
        if replaced {
            warn!(%transport, "replaced previously registered backend");
        } else {
            info!(%transport, "backend registered");
        }
    }

    /// The backend registered for `transport`, if any.
    #[must_use]
    pub fn backend(&self, transport: TransportType) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(&transport).cloned()
    }

    /// All registered backends, in deterministic transport order.
    #[must_use]
    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.backends.read().values().cloned().collect()
    }

    /// Transports with a registered backend.
    #[must_use]
    pub fn transports(&self) -> Vec<TransportType> {
        self.backends.read().keys().copied().collect()
    }

    /// A [`DeviceIndex`] over this context with the default transport
    /// priority.
    #[must_use]
    pub fn device_index(self: &Arc<Self>) -> DeviceIndex {
        DeviceIndex::new(Arc::clone(self))
    }
}
