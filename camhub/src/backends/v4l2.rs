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

//! Video4Linux2 transport backend.
//!
//! Enumerates `/dev/video*` capture nodes, maps V4L2 pixel formats and
//! controls onto the generic capture model, and streams through memory-mapped
//! kernel buffers. V4L2 exposes no serial numbers through the capture API, so
//! every identity carries an empty serial and never participates in
//! cross-transport deduplication.
//!
//! The acquisition thread owns the device for the duration of a stream;
//! property I/O waits a bounded interval for it and reports
//! [`CamhubError::Busy`] rather than stall.
// TODO: route control ioctls through a second fd on the same node so
// property writes succeed mid-stream.

use std::collections::HashSet;
use std::io;
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
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{self, Control};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

/// How long property I/O waits for a device busy with streaming.
const CONTROL_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

const KERNEL_STREAM_BUFFERS: u32 = 4;

// Control ids from videodev2.h for the controls with a canonical name.
const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_GAMMA: u32 = 0x0098_0910;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

/// Backend for kernel video devices.
pub struct V4l2Backend {
    open: Arc<Mutex<HashSet<String>>>,
}

impl V4l2Backend {
    /// Loads the backend. A host with no video nodes at all reports
    /// `NotFound`, which the registry downgrades to a skip.
    pub fn probe() -> Result<Self, CamhubError> {
        if v4l::context::enum_devices().is_empty() {
            return Err(CamhubError::NotFound(
                "no video4linux nodes present".to_string(),
            ));
        }
        Ok(V4l2Backend {
            open: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

impl Backend for V4l2Backend {
    fn transport(&self) -> TransportType {
        TransportType::V4l2
    }

    fn enumerate(&self) -> Result<Vec<DeviceIdentity>, CamhubError> {
        let mut identities = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_string_lossy().to_string();
            let display_name = node.name().unwrap_or_else(|| path.clone());
            identities.push(DeviceIdentity::new(
                TransportType::V4l2,
                &path,
                display_name,
                "",
            ));
        }
        Ok(identities)
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceHandle>, CamhubError> {
        let path = identity.identifier().to_string();
        if !self.open.lock().insert(path.clone()) {
            return Err(CamhubError::Busy(format!(
                "device `{path}` is already open"
            )));
        }
        let device = match Device::with_path(&path) {
            Ok(device) => device,
            Err(why) => {
                self.open.lock().remove(&path);
                return Err(map_io_error(&why, &path));
            }
        };
        debug!(device = %identity, "v4l2 device opened");
        Ok(Box::new(V4l2Handle {
            identity: identity.clone(),
            device: Arc::new(Mutex::new(device)),
            format: None,
            stream: None,
            open: Arc::clone(&self.open),
        }))
    }
}

struct V4l2Stream {
    die: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

struct V4l2Handle {
    identity: DeviceIdentity,
    device: Arc<Mutex<Device>>,
    format: Option<VideoFormat>,
    stream: Option<V4l2Stream>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl V4l2Handle {
    /// Bounded wait for the device; the acquisition thread holds it for the
    /// whole stream.
    fn lock_device(&self) -> Result<parking_lot::MutexGuard<'_, Device>, CamhubError> {
        self.device.try_lock_for(CONTROL_LOCK_TIMEOUT).ok_or_else(|| {
            CamhubError::Busy(format!(
                "device `{}` is streaming; control access timed out",
                self.identity.identifier()
            ))
        })
    }

    fn transport_err(&self, why: &io::Error) -> CamhubError {
        map_io_error(why, self.identity.identifier())
    }

    fn find_control(
        &self,
        device: &Device,
        name: &str,
    ) -> Result<control::Description, CamhubError> {
        let controls = device.query_controls().map_err(|e| self.transport_err(&e))?;
        controls
            .into_iter()
            .find(|desc| canonical_name(desc) == name)
            .ok_or_else(|| CamhubError::NotFound(format!("property `{name}`")))
    }

    fn read_control(
        &self,
        device: &Device,
        desc: &control::Description,
    ) -> Result<PropertyValue, CamhubError> {
        let ctrl = device.control(desc.id).map_err(|e| self.transport_err(&e))?;
        Ok(match ctrl.value {
            control::Value::Boolean(v) => PropertyValue::Boolean(v),
            control::Value::Integer(v) => match menu_variants(desc) {
                Some(variants) => {
                    let index = usize::try_from(v).unwrap_or(0);
                    PropertyValue::Enumeration(
                        variants.get(index).cloned().unwrap_or_else(|| v.to_string()),
                    )
                }
                None => PropertyValue::Integer(v),
            },
            other => {
                return Err(CamhubError::Unsupported(format!(
                    "control `{}` has unsupported payload {other:?}",
                    desc.name
                )))
            }
        })
    }
}

impl DeviceHandle for V4l2Handle {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn formats(&mut self) -> Result<Vec<VideoFormatDescription>, CamhubError> {
        let device = self.lock_device()?;
        let mut descriptions = Vec::new();
        let formats = device.enum_formats().map_err(|e| self.transport_err(&e))?;
        for format in formats {
            let Some(encoding) = encoding_from_fourcc(format.fourcc) else {
                continue;
            };
            let sizes = device
                .enum_framesizes(format.fourcc)
                .map_err(|e| self.transport_err(&e))?;
            for size in sizes {
                let FrameSizeEnum::Discrete(discrete) = size.size else {
                    continue;
                };
                let intervals = device
                    .enum_frameintervals(format.fourcc, discrete.width, discrete.height)
                    .map_err(|e| self.transport_err(&e))?;
                let mut rates: Vec<u32> = intervals
                    .into_iter()
                    .filter_map(|interval| match interval.interval {
                        FrameIntervalEnum::Discrete(f) => rate_of(&f),
                        FrameIntervalEnum::Stepwise(s) => rate_of(&s.min),
                    })
                    .collect();
                rates.sort_unstable();
                rates.dedup();
                if rates.is_empty() {
                    continue;
                }
                descriptions.push(VideoFormatDescription::new(
                    encoding,
                    discrete.width,
                    discrete.height,
                    rates,
                ));
            }
        }
        Ok(descriptions)
    }

    fn negotiate_format(&mut self, requested: VideoFormat) -> Result<VideoFormat, CamhubError> {
        let device = self.lock_device()?;
        let fourcc = fourcc_from_encoding(requested.encoding);
        let wanted = Format::new(requested.width, requested.height, fourcc);
        let actual = device.set_format(&wanted).map_err(|e| self.transport_err(&e))?;
        // Set then verify: drivers silently substitute the nearest format.
        if actual.fourcc != fourcc
            || actual.width != requested.width
            || actual.height != requested.height
        {
            return Err(CamhubError::Unsupported(format!(
                "device settled on {}x{} {} instead of {requested}",
                actual.width, actual.height, actual.fourcc
            )));
        }
        let mut params = device.params().map_err(|e| self.transport_err(&e))?;
        params.interval = Fraction::new(1, requested.frame_rate);
        let params = device.set_params(&params).map_err(|e| self.transport_err(&e))?;
        let rate = rate_of(&params.interval).unwrap_or(requested.frame_rate);
        let negotiated = VideoFormat::new(requested.encoding, actual.width, actual.height, rate);
        drop(device);
        self.format = Some(negotiated);
        Ok(negotiated)
    }

    fn list_properties(&mut self) -> Result<Vec<PropertyDescriptor>, CamhubError> {
        let device = self.lock_device()?;
        let controls = device.query_controls().map_err(|e| self.transport_err(&e))?;
        let mut descriptors = Vec::new();
        for desc in controls {
            if desc.flags.contains(control::Flags::DISABLED) {
                continue;
            }
            let Some(range) = control_range(&desc) else {
                continue;
            };
            let mut flags = if desc.flags.contains(control::Flags::READ_ONLY)
                || desc.flags.contains(control::Flags::INACTIVE)
            {
                PropertyFlags::read_only()
            } else {
                PropertyFlags::read_write()
            };
            if desc.flags.contains(control::Flags::GRABBED) {
                flags = flags.locked_while_streaming();
            }
            let mut descriptor =
                PropertyDescriptor::new(canonical_name(&desc), &desc.name, range, flags);
            match self.read_control(&device, &desc) {
                Ok(value) => descriptor.set_value(value),
                Err(why) => {
                    debug!(control = %desc.name, error = %why, "control read failed, reporting default");
                }
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    fn property(&mut self, name: &str) -> Result<PropertyValue, CamhubError> {
        let device = self.lock_device()?;
        let desc = self.find_control(&device, name)?;
        self.read_control(&device, &desc)
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), CamhubError> {
        let device = self.lock_device()?;
        let desc = self.find_control(&device, name)?;
        let raw = match value {
            PropertyValue::Boolean(v) => control::Value::Boolean(*v),
            PropertyValue::Integer(v) => control::Value::Integer(*v),
            PropertyValue::Enumeration(variant) => {
                let variants = menu_variants(&desc).ok_or_else(|| CamhubError::InvalidValue {
                    property: name.to_string(),
                    value: value.to_string(),
                    reason: "control is not a menu".to_string(),
                })?;
                let index = variants.iter().position(|v| v == variant).ok_or_else(|| {
                    CamhubError::InvalidValue {
                        property: name.to_string(),
                        value: value.to_string(),
                        reason: format!("not one of {variants:?}"),
                    }
                })?;
                control::Value::Integer(index as i64)
            }
            PropertyValue::Float(_) => {
                return Err(CamhubError::InvalidValue {
                    property: name.to_string(),
                    value: value.to_string(),
                    reason: "v4l2 controls carry integer payloads".to_string(),
                })
            }
        };
        device
            .set_control(Control {
                id: desc.id,
                value: raw,
            })
            .map_err(|e| self.transport_err(&e))
    }

    fn start_stream(
        &mut self,
        pool: BufferPool,
        on_event: StreamEventHandler,
    ) -> Result<(), CamhubError> {
        if self.format.is_none() {
            return Err(CamhubError::invalid_state("start stream", "unconfigured"));
        }
        if self.stream.is_some() {
            return Err(CamhubError::Busy("stream is already running".to_string()));
        }

        let die = Arc::new(AtomicBool::new(false));
        let die_flag = Arc::clone(&die);
        let device = Arc::clone(&self.device);
        let identity = self.identity.clone();
        debug!(device = %identity, "v4l2 stream starting");

        let worker = std::thread::spawn(move || {
            // The thread owns the device until the stream dies; control I/O
            // in the meantime times out with Busy.
            let guard = device.lock();
            let mut stream = match MmapStream::with_buffers(
                &guard,
                Type::VideoCapture,
                KERNEL_STREAM_BUFFERS,
            ) {
                Ok(stream) => stream,
                Err(why) => {
                    on_event(StreamEvent::Fault(map_io_error(
                        &why,
                        identity.identifier(),
                    )));
                    return;
                }
            };
            while !die_flag.load(Ordering::Acquire) {
                let (data, meta) = match stream.next() {
                    Ok(frame) => frame,
                    Err(why) => {
                        if die_flag.load(Ordering::Acquire) {
                            return;
                        }
                        on_event(StreamEvent::Fault(map_io_error(
                            &why,
                            identity.identifier(),
                        )));
                        return;
                    }
                };
                let len = (meta.bytesused as usize).min(data.len());
                let Some(mut lease) = pool.acquire() else {
                    // Every slot is under an active read; skip this frame.
                    continue;
                };
                if let Err(why) = lease.write(&data[..len]) {
                    warn!(device = %identity, error = %why, "frame exceeds pool slot, skipped");
                    continue;
                }
                on_event(StreamEvent::Frame(lease.publish(SystemTime::now())));
            }
        });

        self.stream = Some(V4l2Stream { die, worker });
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

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        let _ = self.stop_stream();
        self.open.lock().remove(self.identity.identifier());
    }
}

fn encoding_from_fourcc(fourcc: FourCC) -> Option<PixelEncoding> {
    match &fourcc.repr {
        b"GREY" => Some(PixelEncoding::Mono8),
        b"RGB3" => Some(PixelEncoding::Rgb8),
        b"BGR3" => Some(PixelEncoding::Bgr8),
        b"YUYV" => Some(PixelEncoding::Yuyv),
        b"NV12" => Some(PixelEncoding::Nv12),
        b"MJPG" => Some(PixelEncoding::Mjpeg),
        _ => None,
    }
}

fn fourcc_from_encoding(encoding: PixelEncoding) -> FourCC {
    match encoding {
        PixelEncoding::Mono8 => FourCC::new(b"GREY"),
        PixelEncoding::Rgb8 => FourCC::new(b"RGB3"),
        PixelEncoding::Bgr8 => FourCC::new(b"BGR3"),
        PixelEncoding::Yuyv => FourCC::new(b"YUYV"),
        PixelEncoding::Nv12 => FourCC::new(b"NV12"),
        PixelEncoding::Mjpeg => FourCC::new(b"MJPG"),
    }
}

/// Frame rate of a V4L2 frame interval (intervals are seconds per frame).
fn rate_of(interval: &Fraction) -> Option<u32> {
    if interval.numerator == 0 {
        return None;
    }
    Some(interval.denominator / interval.numerator)
}

/// Transport-agnostic name for a control: canonical names for the controls
/// every backend agrees on, the driver's own name otherwise.
fn canonical_name(desc: &control::Description) -> String {
    match desc.id {
        CID_BRIGHTNESS => wellknown::BRIGHTNESS.to_string(),
        CID_GAMMA => wellknown::GAMMA.to_string(),
        CID_GAIN => wellknown::GAIN.to_string(),
        CID_EXPOSURE_AUTO => wellknown::AUTO_EXPOSURE.to_string(),
        CID_EXPOSURE_ABSOLUTE => wellknown::EXPOSURE_TIME.to_string(),
        _ => desc.name.clone(),
    }
}

fn menu_variants(desc: &control::Description) -> Option<Vec<String>> {
    let items = desc.items.as_ref()?;
    Some(
        items
            .iter()
            .map(|(_, item)| match item {
                control::MenuItem::Name(name) => name.clone(),
                control::MenuItem::Value(value) => value.to_string(),
            })
            .collect(),
    )
}

fn control_range(desc: &control::Description) -> Option<PropertyRange> {
    match desc.typ {
        control::Type::Boolean => Some(PropertyRange::Boolean {
            default: desc.default != 0,
        }),
        control::Type::Integer => Some(PropertyRange::Integer {
            min: desc.minimum,
            max: desc.maximum,
            step: i64::try_from(desc.step).unwrap_or(1),
            default: desc.default,
        }),
        control::Type::Menu | control::Type::IntegerMenu => {
            let variants = menu_variants(desc)?;
            let default_index = usize::try_from(desc.default).unwrap_or(0);
            let default = variants.get(default_index).cloned()?;
            Some(PropertyRange::Enumeration { variants, default })
        }
        _ => None,
    }
}

fn map_io_error(why: &io::Error, path: &str) -> CamhubError {
    const EBUSY: i32 = 16;
    match why.kind() {
        io::ErrorKind::NotFound => {
            CamhubError::NotFound(format!("device `{path}` disappeared"))
        }
        io::ErrorKind::PermissionDenied => CamhubError::PermissionDenied(format!(
            "no access to `{path}`; check video group membership"
        )),
        _ if why.raw_os_error() == Some(EBUSY) => {
            CamhubError::Busy(format!("device `{path}` is in use"))
        }
        _ => CamhubError::transport(TransportType::V4l2, why),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_round_trips() {
        for encoding in [
            PixelEncoding::Mono8,
            PixelEncoding::Rgb8,
            PixelEncoding::Bgr8,
            PixelEncoding::Yuyv,
            PixelEncoding::Nv12,
            PixelEncoding::Mjpeg,
        ] {
            assert_eq!(
                encoding_from_fourcc(fourcc_from_encoding(encoding)),
                Some(encoding)
            );
        }
        assert_eq!(encoding_from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn interval_to_rate_conversion() {
        assert_eq!(rate_of(&Fraction::new(1, 30)), Some(30));
        assert_eq!(rate_of(&Fraction::new(1, 60)), Some(60));
        assert_eq!(rate_of(&Fraction::new(0, 30)), None);
    }

    #[test]
    fn io_errors_map_onto_the_error_taxonomy() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            map_io_error(&denied, "/dev/video0"),
            CamhubError::PermissionDenied(_)
        ));

        let gone = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            map_io_error(&gone, "/dev/video0"),
            CamhubError::NotFound(_)
        ));

        let busy = io::Error::from_raw_os_error(16);
        assert!(matches!(
            map_io_error(&busy, "/dev/video0"),
            CamhubError::Busy(_)
        ));

        let other = io::Error::from_raw_os_error(5);
        assert!(matches!(
            map_io_error(&other, "/dev/video0"),
            CamhubError::Transport { .. }
        ));
    }
}
