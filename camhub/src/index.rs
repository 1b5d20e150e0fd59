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

//! The aggregated, deduplicated device catalog.
//!
//! [`DeviceIndex::refresh`] enumerates every backend registered with the
//! context and collapses sightings of the same physical device across
//! transports into one canonical entry. Two identities are the same device
//! iff their serial numbers are non-empty and equal; the winner is the
//! highest-priority transport per the index's [`TransportPriority`].
//! `refresh` only touches enumeration, never live device handles, so it is
//! safe to run while devices are open and streaming.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use camhub_core::{CamhubError, DeviceIdentity, TransportPriority};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::CaptureDevice;
use crate::registry::CaptureContext;

/// Deduplicated catalog of devices across all registered backends.
pub struct DeviceIndex {
    context: Arc<CaptureContext>,
    priority: TransportPriority,
    snapshot: RwLock<Vec<CaptureDevice>>,
}

impl DeviceIndex {
    /// An index with the default transport priority
    /// (GigE Vision > USB > V4L2 > Virtual).
    #[must_use]
    pub fn new(context: Arc<CaptureContext>) -> Self {
        DeviceIndex::with_priority(context, TransportPriority::default())
    }

    /// An index with an explicit transport priority for dedup tie-breaks.
    #[must_use]
    pub fn with_priority(context: Arc<CaptureContext>, priority: TransportPriority) -> Self {
        DeviceIndex {
            context,
            priority,
            snapshot: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn priority(&self) -> &TransportPriority {
        &self.priority
    }

    /// Re-enumerates every registered backend and rebuilds the catalog
    /// snapshot. A backend whose enumeration fails contributes nothing and
    /// is reported at warn level; the refresh itself never fails.
    pub fn refresh(&self) {
        let mut identities = Vec::new();
        for backend in self.context.backends() {
            match backend.enumerate() {
                Ok(found) => {
                    debug!(
                        transport = %backend.transport(),
                        count = found.len(),
                        "backend enumeration complete"
                    );
                    identities.extend(found);
                }
                Err(why) => {
                    warn!(
                        transport = %backend.transport(),
                        error = %why,
                        "backend enumeration failed"
                    );
                }
            }
        }

        let devices = self.deduplicate(identities);
        info!(count = devices.len(), "device catalog refreshed");
        *self.snapshot.write() = devices;
    }

    /// The latest catalog snapshot, recomputed only on [`refresh`](Self::refresh).
    #[must_use]
    pub fn list(&self) -> Vec<CaptureDevice> {
        self.snapshot.read().clone()
    }

    /// Looks a device up by its stable identifier in the latest snapshot.
    pub fn find(&self, identifier: &str) -> Result<CaptureDevice, CamhubError> {
        self.snapshot
            .read()
            .iter()
            .find(|device| device.identifier() == identifier)
            .cloned()
            .ok_or_else(|| CamhubError::NotFound(format!("device `{identifier}`")))
    }

    fn deduplicate(&self, identities: Vec<DeviceIdentity>) -> Vec<CaptureDevice> {
        let mut by_serial: BTreeMap<String, DeviceIdentity> = BTreeMap::new();
        let mut without_serial = Vec::new();

        for identity in identities {
            if identity.serial().is_empty() {
                without_serial.push(identity);
                continue;
            }
            match by_serial.entry(identity.serial().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(identity);
                }
                Entry::Occupied(mut slot) => {
                    if self.outranks(&identity, slot.get()) {
                        debug!(
                            serial = identity.serial(),
                            winner = %identity.transport(),
                            loser = %slot.get().transport(),
                            "collapsed duplicate device sighting"
                        );
                        slot.insert(identity);
                    } else {
                        debug!(
                            serial = identity.serial(),
                            winner = %slot.get().transport(),
                            loser = %identity.transport(),
                            "collapsed duplicate device sighting"
                        );
                    }
                }
            }
        }

        let mut merged: Vec<DeviceIdentity> =
            by_serial.into_values().chain(without_serial).collect();
        // Deterministic catalog order regardless of backend iteration order.
        merged.sort_by(|a, b| {
            self.priority
                .rank(a.transport())
                .cmp(&self.priority.rank(b.transport()))
                .then_with(|| a.identifier().cmp(b.identifier()))
        });
        merged
            .into_iter()
            .map(|identity| CaptureDevice::new(identity, Arc::clone(&self.context)))
            .collect()
    }

    fn outranks(&self, candidate: &DeviceIdentity, incumbent: &DeviceIdentity) -> bool {
        let candidate_key = (
            self.priority.rank(candidate.transport()),
            candidate.identifier(),
        );
        let incumbent_key = (
            self.priority.rank(incumbent.transport()),
            incumbent.identifier(),
        );
        candidate_key < incumbent_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimulatedBackend, SimulatedDeviceSpec};
    use camhub_core::TransportType;

    fn context_with(
        backends: impl IntoIterator<Item = SimulatedBackend>,
    ) -> Arc<CaptureContext> {
        let context = CaptureContext::new();
        for backend in backends {
            context.register(Arc::new(backend));
        }
        context
    }

    fn backend_on(transport: TransportType, devices: &[(&str, &str)]) -> SimulatedBackend {
        let mut backend = SimulatedBackend::new().with_transport(transport);
        for (identifier, serial) in devices {
            backend = backend.with_device(SimulatedDeviceSpec::new(
                *identifier,
                format!("Test Camera {identifier}"),
                *serial,
            ));
        }
        backend
    }

    #[test]
    fn equal_serials_across_transports_collapse_to_one_entry() {
        let context = context_with([
            backend_on(TransportType::Usb, &[("usb-0", "SN-X")]),
            backend_on(TransportType::GigEVision, &[("gige-0", "SN-X")]),
        ]);
        let index = context.device_index();
        index.refresh();

        let devices = index.list();
        assert_eq!(devices.len(), 1);
        // Default priority prefers GigE Vision over USB.
        assert_eq!(devices[0].transport(), TransportType::GigEVision);
        assert_eq!(devices[0].serial(), "SN-X");
    }

    #[test]
    fn priority_order_is_explicit_configuration() {
        let context = context_with([
            backend_on(TransportType::Usb, &[("usb-0", "SN-X")]),
            backend_on(TransportType::GigEVision, &[("gige-0", "SN-X")]),
        ]);
        let index = DeviceIndex::with_priority(
            context,
            TransportPriority(vec![TransportType::Usb, TransportType::GigEVision]),
        );
        index.refresh();

        let devices = index.list();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].transport(), TransportType::Usb);
    }

    #[test]
    fn empty_serials_never_deduplicate() {
        let context = context_with([
            backend_on(TransportType::Usb, &[("usb-0", "")]),
            backend_on(TransportType::V4l2, &[("/dev/video0", "")]),
        ]);
        let index = context.device_index();
        index.refresh();
        assert_eq!(index.list().len(), 2);
    }

    #[test]
    fn snapshot_only_changes_on_refresh() {
        let context = context_with([backend_on(TransportType::Usb, &[("usb-0", "SN-A")])]);
        let index = context.device_index();
        assert!(index.list().is_empty());

        index.refresh();
        assert_eq!(index.list().len(), 1);
    }

    #[test]
    fn find_resolves_by_identifier() {
        let context = context_with([backend_on(
            TransportType::Usb,
            &[("usb-0", "SN-A"), ("usb-1", "SN-B")],
        )]);
        let index = context.device_index();
        index.refresh();

        assert_eq!(index.find("usb-1").unwrap().serial(), "SN-B");
        assert!(matches!(
            index.find("usb-9"),
            Err(CamhubError::NotFound(_))
        ));
    }

    #[test]
    fn catalog_order_is_deterministic() {
        let context = context_with([
            backend_on(TransportType::V4l2, &[("/dev/video1", ""), ("/dev/video0", "")]),
            backend_on(TransportType::Usb, &[("usb-1", "SN-B"), ("usb-0", "SN-A")]),
        ]);
        let index = context.device_index();
        index.refresh();

        let identifiers: Vec<String> = index
            .list()
            .iter()
            .map(|d| d.identifier().to_string())
            .collect();
        assert_eq!(identifiers, vec!["usb-0", "usb-1", "/dev/video0", "/dev/video1"]);
    }
}
