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

//! Synthetic transport backend.
//!
//! Produces moving test-pattern frames paced to the negotiated rate from a
//! configurable device table, with a full property table including the
//! auto-exposure interdependency. Useful as a stand-in where no hardware is
//! attached and as the in-tree fixture for pipeline behavior; device loss is
//! scriptable through [`SimulatedDeviceSpec::fail_after_frames`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use camhub_core::property::wellknown;
use camhub_core::{
    Backend, BufferPool, CamhubError, DeviceHandle, DeviceIdentity, PixelEncoding,
    PropertyDescriptor, PropertyFlags, PropertyRange, PropertyValue, StreamEvent,
    StreamEventHandler, TransportType, VideoFormat, VideoFormatDescription,
};
use parking_lot::Mutex;
use tracing::debug;

/// One row of the simulated device table.
#[derive(Clone, Debug)]
pub struct SimulatedDeviceSpec {
    identifier: String,
    display_name: String,
    serial: String,
    fail_after_frames: Option<u64>,
}

impl SimulatedDeviceSpec {
    pub fn new(
        identifier: impl ToString,
        display_name: impl ToString,
        serial: impl ToString,
    ) -> Self {
        SimulatedDeviceSpec {
            identifier: identifier.to_string(),
            display_name: display_name.to_string(),
            serial: serial.to_string(),
            fail_after_frames: None,
        }
    }

    /// Scripts a device-loss fault after this many delivered frames.
    #[must_use]
    pub fn fail_after_frames(mut self, frames: u64) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }
}

/// Backend serving the configured device table over a synthetic transport.
///
/// Reports [`TransportType::Virtual`] by default; tests that exercise
/// cross-transport behavior inject another transport with
/// [`with_transport`](Self::with_transport).
pub struct SimulatedBackend {
    transport: TransportType,
    devices: Vec<SimulatedDeviceSpec>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        SimulatedBackend {
            transport: TransportType::Virtual,
            devices: Vec::new(),
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_device(mut self, spec: SimulatedDeviceSpec) -> Self {
        self.devices.push(spec);
        self
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        SimulatedBackend::new()
    }
}

impl Backend for SimulatedBackend {
    fn transport(&self) -> TransportType {
        self.transport
    }

    fn enumerate(&self) -> Result<Vec<DeviceIdentity>, CamhubError> {
        Ok(self
            .devices
            .iter()
            .map(|spec| {
                DeviceIdentity::new(
                    self.transport,
                    &spec.identifier,
                    &spec.display_name,
                    &spec.serial,
                )
            })
            .collect())
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceHandle>, CamhubError> {
        let spec = self
            .devices
            .iter()
            .find(|spec| spec.identifier == identity.identifier())
            .ok_or_else(|| {
                CamhubError::NotFound(format!("simulated device `{}`", identity.identifier()))
            })?;
        if !self.open.lock().insert(spec.identifier.clone()) {
            return Err(CamhubError::Busy(format!(
                "device `{}` is already open",
                spec.identifier
            )));
        }
        Ok(Box::new(SimulatedHandle {
            identity: DeviceIdentity::new(
                self.transport,
                &spec.identifier,
                &spec.display_name,
                &spec.serial,
            ),
            transport: self.transport,
            open: Arc::clone(&self.open),
            properties: default_property_table(),
            format: None,
            fail_after: spec.fail_after_frames,
            stream: None,
        }))
    }
}

fn capabilities() -> Vec<VideoFormatDescription> {
    vec![
        VideoFormatDescription::new(PixelEncoding::Mono8, 160, 120, vec![30, 60, 120]),
        VideoFormatDescription::new(PixelEncoding::Mono8, 640, 480, vec![15, 30, 60]),
        VideoFormatDescription::new(PixelEncoding::Mono8, 1280, 720, vec![15, 30]),
        VideoFormatDescription::new(PixelEncoding::Yuyv, 640, 480, vec![15, 30, 60]),
        VideoFormatDescription::new(PixelEncoding::Yuyv, 1280, 720, vec![15, 30]),
    ]
}

fn default_property_table() -> BTreeMap<String, PropertyDescriptor> {
    let descriptors = [
        PropertyDescriptor::new(
            wellknown::AUTO_EXPOSURE,
            "Continuous automatic exposure",
            PropertyRange::Boolean { default: false },
            PropertyFlags::read_write(),
        ),
        PropertyDescriptor::new(
            wellknown::EXPOSURE_TIME,
            "Exposure time in microseconds",
            PropertyRange::Float {
                min: 10.0,
                max: 30_000.0,
                step: 100.0,
                default: 10_000.0,
            },
            PropertyFlags::read_write(),
        ),
        PropertyDescriptor::new(
            wellknown::GAIN,
            "Analog gain in decibels",
            PropertyRange::Float {
                min: 0.0,
                max: 48.0,
                step: 0.0,
                default: 0.0,
            },
            PropertyFlags::read_write(),
        ),
        PropertyDescriptor::new(
            wellknown::BRIGHTNESS,
            "Black level offset",
            PropertyRange::Integer {
                min: 0,
                max: 255,
                step: 16,
                default: 128,
            },
            PropertyFlags::read_write(),
        ),
        PropertyDescriptor::new(
            wellknown::TRIGGER_MODE,
            "Acquisition trigger source",
            PropertyRange::Enumeration {
                variants: vec![
                    "Off".to_string(),
                    "Software".to_string(),
                    "Hardware".to_string(),
                ],
                default: "Off".to_string(),
            },
            PropertyFlags::read_write().locked_while_streaming(),
        ),
    ];
    descriptors
        .into_iter()
        .map(|d| (d.name().to_string(), d))
        .collect()
}

struct SimulatedStream {
    die: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

struct SimulatedHandle {
    identity: DeviceIdentity,
    transport: TransportType,
    open: Arc<Mutex<HashSet<String>>>,
    properties: BTreeMap<String, PropertyDescriptor>,
    format: Option<VideoFormat>,
    fail_after: Option<u64>,
    stream: Option<SimulatedStream>,
}

impl DeviceHandle for SimulatedHandle {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn formats(&mut self) -> Result<Vec<VideoFormatDescription>, CamhubError> {
        Ok(capabilities())
    }

    fn negotiate_format(&mut self, requested: VideoFormat) -> Result<VideoFormat, CamhubError> {
        if !capabilities().iter().any(|d| d.supports(&requested)) {
            return Err(CamhubError::Unsupported(format!(
                "{requested} is outside device capability"
            )));
        }
        self.format = Some(requested);
        Ok(requested)
    }

    fn list_properties(&mut self) -> Result<Vec<PropertyDescriptor>, CamhubError> {
        Ok(self.properties.values().cloned().collect())
    }

    fn property(&mut self, name: &str) -> Result<PropertyValue, CamhubError> {
        self.properties
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| CamhubError::NotFound(format!("property `{name}`")))
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), CamhubError> {
        let descriptor = self
            .properties
            .get_mut(name)
            .ok_or_else(|| CamhubError::NotFound(format!("property `{name}`")))?;
        if !descriptor.flags().writable {
            return Err(CamhubError::NotWritable(name.to_string()));
        }
        // Simulated hardware clamps silently, like much of the real thing.
        descriptor.set_value(descriptor.range().clamp(value));

        if name == wellknown::AUTO_EXPOSURE {
            let auto_enabled = matches!(value, PropertyValue::Boolean(true));
            if let Some(exposure) = self.properties.get_mut(wellknown::EXPOSURE_TIME) {
                let mut flags = exposure.flags();
                flags.writable = !auto_enabled;
                exposure.set_flags(flags);
            }
        }
        Ok(())
    }

    fn start_stream(
        &mut self,
        pool: BufferPool,
        on_event: StreamEventHandler,
    ) -> Result<(), CamhubError> {
        let format = self.format.ok_or_else(|| {
            CamhubError::invalid_state("start stream", "unconfigured")
        })?;
        if self.stream.is_some() {
            return Err(CamhubError::Busy("stream is already running".to_string()));
        }

        let die = Arc::new(AtomicBool::new(false));
        let die_flag = Arc::clone(&die);
        let transport = self.transport;
        let fail_after = self.fail_after;
        debug!(device = %self.identity, %format, "simulated stream starting");

        let worker = std::thread::spawn(move || {
            let interval = Duration::from_secs_f64(1.0 / f64::from(format.frame_rate.max(1)));
            let frame_size = format.frame_size();
            let mut produced: u64 = 0;
            while !die_flag.load(Ordering::Acquire) {
                if fail_after.is_some_and(|limit| produced >= limit) {
                    on_event(StreamEvent::Fault(CamhubError::transport(
                        transport,
                        "simulated device loss",
                    )));
                    return;
                }
                if let Some(mut lease) = pool.acquire() {
                    let offset = produced as usize;
                    lease.fill_with(|buf| {
                        for (i, byte) in buf.iter_mut().enumerate() {
                            *byte = ((i + offset) & 0xff) as u8;
                        }
                        frame_size
                    });
                    on_event(StreamEvent::Frame(lease.publish(SystemTime::now())));
                    produced += 1;
                }
                std::thread::sleep(interval);
            }
        });

        self.stream = Some(SimulatedStream { die, worker });
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CamhubError> {
        if let Some(stream) = self.stream.take() {
            stream.die.store(true, Ordering::Release);
            let _ = stream.worker.join();
        }
        Ok(())
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        let _ = self.stop_stream();
        self.open.lock().remove(self.identity.identifier());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_handle() -> Box<dyn DeviceHandle> {
        let backend = SimulatedBackend::new().with_device(SimulatedDeviceSpec::new(
            "sim-0",
            "Simulated Camera",
            "SN-1",
        ));
        let identity = backend.enumerate().unwrap().remove(0);
        backend.open(&identity).unwrap()
    }

    #[test]
    fn handle_drop_releases_the_open_slot() {
        let backend = SimulatedBackend::new().with_device(SimulatedDeviceSpec::new(
            "sim-0",
            "Simulated Camera",
            "SN-1",
        ));
        let identity = backend.enumerate().unwrap().remove(0);
        let handle = backend.open(&identity).unwrap();
        assert!(matches!(backend.open(&identity), Err(CamhubError::Busy(_))));
        drop(handle);
        assert!(backend.open(&identity).is_ok());
    }

    #[test]
    fn negotiation_rejects_formats_above_capability() {
        let mut handle = open_handle();
        let too_big = VideoFormat::new(PixelEncoding::Mono8, 1920, 1080, 30);
        assert!(matches!(
            handle.negotiate_format(too_big),
            Err(CamhubError::Unsupported(_))
        ));
        let ok = VideoFormat::new(PixelEncoding::Mono8, 1280, 720, 30);
        assert_eq!(handle.negotiate_format(ok).unwrap(), ok);
    }

    #[test]
    fn hardware_clamps_to_the_step_grid() {
        let mut handle = open_handle();
        handle
            .set_property(wellknown::BRIGHTNESS, &PropertyValue::Integer(37))
            .unwrap();
        assert_eq!(
            handle.property(wellknown::BRIGHTNESS).unwrap(),
            PropertyValue::Integer(32)
        );
    }

    #[test]
    fn auto_exposure_locks_manual_exposure() {
        let mut handle = open_handle();
        handle
            .set_property(wellknown::AUTO_EXPOSURE, &PropertyValue::Boolean(true))
            .unwrap();
        assert!(matches!(
            handle.set_property(wellknown::EXPOSURE_TIME, &PropertyValue::Float(500.0)),
            Err(CamhubError::NotWritable(_))
        ));

        handle
            .set_property(wellknown::AUTO_EXPOSURE, &PropertyValue::Boolean(false))
            .unwrap();
        assert!(handle
            .set_property(wellknown::EXPOSURE_TIME, &PropertyValue::Float(500.0))
            .is_ok());
    }

    #[test]
    fn stream_delivers_pattern_frames() {
        let mut handle = open_handle();
        let format = VideoFormat::new(PixelEncoding::Mono8, 160, 120, 120);
        handle.negotiate_format(format).unwrap();

        let pool = BufferPool::new(format, 4);
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        handle
            .start_stream(
                pool,
                Arc::new(move |event| {
                    if let StreamEvent::Frame(frame) = event {
                        received_clone.lock().push(frame.frame_id());
                    }
                }),
            )
            .unwrap();

        while received.lock().len() < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop_stream().unwrap();

        let ids = received.lock().clone();
        assert!(ids.len() >= 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
