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

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use camhub_core::{CamhubError, DeviceIdentity, TransportType};
use tracing::info;

use crate::pipeline::PipelineManager;
use crate::registry::CaptureContext;

/// One catalog entry: an immutable identity snapshot plus the context that
/// can resolve its owning backend.
///
/// A `CaptureDevice` owns no live connection; it is created by the device
/// index during `refresh()` and replaced wholesale on re-enumeration.
/// Equality is by identity, so entries from successive refreshes compare
/// equal when they describe the same device.
#[derive(Clone)]
pub struct CaptureDevice {
    identity: DeviceIdentity,
    context: Arc<CaptureContext>,
}

impl CaptureDevice {
    pub(crate) fn new(identity: DeviceIdentity, context: Arc<CaptureContext>) -> Self {
        CaptureDevice { identity, context }
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    #[must_use]
    pub fn transport(&self) -> TransportType {
        self.identity.transport()
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        self.identity.identifier()
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.identity.display_name()
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        self.identity.serial()
    }

    /// Opens the device through its owning backend and returns the pipeline
    /// that manages the open handle.
    ///
    /// # Errors
    /// [`CamhubError::NotFound`] when the backend is gone or the snapshot is
    /// stale, [`CamhubError::Busy`] when the device is already open,
    /// [`CamhubError::PermissionDenied`] on transport-level access failure.
    pub fn open(&self) -> Result<PipelineManager, CamhubError> {
        let backend = self.context.backend(self.transport()).ok_or_else(|| {
            CamhubError::NotFound(format!(
                "no backend registered for transport {}",
                self.transport()
            ))
        })?;
        let handle = backend.open(&self.identity)?;
        info!(device = %self.identity, "device opened");
        Ok(PipelineManager::new(handle))
    }
}

impl PartialEq for CaptureDevice {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for CaptureDevice {}

impl Debug for CaptureDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("identity", &self.identity)
            .finish()
    }
}

impl Display for CaptureDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.identity, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimulatedBackend, SimulatedDeviceSpec};

    fn sim_context() -> Arc<CaptureContext> {
        let context = CaptureContext::new();
        context.register(Arc::new(SimulatedBackend::new().with_device(
            SimulatedDeviceSpec::new("sim-0", "Simulated Camera", "SN-1"),
        )));
        context
    }

    #[test]
    fn open_resolves_the_owning_backend() {
        let context = sim_context();
        let index = context.device_index();
        index.refresh();
        let device = index.find("sim-0").unwrap();

        let pipeline = device.open().unwrap();
        assert_eq!(pipeline.identity(), device.identity());
    }

    #[test]
    fn double_open_surfaces_busy() {
        let context = sim_context();
        let index = context.device_index();
        index.refresh();
        let device = index.find("sim-0").unwrap();

        let _pipeline = device.open().unwrap();
        assert!(matches!(device.open(), Err(CamhubError::Busy(_))));
    }

    #[test]
    fn open_without_backend_is_not_found() {
        let context = sim_context();
        let index = context.device_index();
        index.refresh();
        let device = index.find("sim-0").unwrap();

        // Same identity, but a context that never loaded the backend.
        let stale = CaptureDevice::new(device.identity().clone(), CaptureContext::new());
        assert!(matches!(stale.open(), Err(CamhubError::NotFound(_))));
    }

    #[test]
    fn devices_compare_by_identity() {
        let context = sim_context();
        let index = context.device_index();
        index.refresh();
        let first = index.find("sim-0").unwrap();
        index.refresh();
        let second = index.find("sim-0").unwrap();
        assert_eq!(first, second);
    }
}
