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

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::CamhubError;

/// The hardware transport a device is reachable through.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportType {
    /// GigE Vision camera on the network.
    GigEVision,
    /// USB(3) Vision / proprietary USB camera.
    Usb,
    /// Kernel video device exposed through Video4Linux.
    V4l2,
    /// Synthetic device, no hardware behind it.
    Virtual,
}

impl TransportType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::GigEVision => "gige",
            TransportType::Usb => "usb",
            TransportType::V4l2 => "v4l2",
            TransportType::Virtual => "virtual",
        }
    }
}

impl Display for TransportType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = CamhubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gige" => Ok(TransportType::GigEVision),
            "usb" => Ok(TransportType::Usb),
            "v4l2" => Ok(TransportType::V4l2),
            "virtual" => Ok(TransportType::Virtual),
            other => Err(CamhubError::NotFound(format!(
                "unknown transport type `{other}`"
            ))),
        }
    }
}

/// Stable identity of one camera as reported by one backend.
///
/// `(transport, identifier)` is unique within a single backend's enumeration.
/// The serial number is what ties together sightings of the same physical
/// device across different transports; backends that cannot read a serial
/// report an empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    transport: TransportType,
    identifier: String,
    display_name: String,
    serial: String,
}

impl DeviceIdentity {
    pub fn new(
        transport: TransportType,
        identifier: impl ToString,
        display_name: impl ToString,
        serial: impl ToString,
    ) -> Self {
        DeviceIdentity {
            transport,
            identifier: identifier.to_string(),
            display_name: display_name.to_string(),
            serial: serial.to_string(),
        }
    }

    #[must_use]
    pub fn transport(&self) -> TransportType {
        self.transport
    }

    /// Backend-scoped stable identifier, e.g. a device path or a MAC address.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Serial number, empty if the backend could not read one.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}@{}, serial: {}]",
            self.display_name, self.transport, self.identifier, self.serial
        )
    }
}

/// Pixel layout of a frame as it leaves the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelEncoding {
    Mono8,
    Rgb8,
    Bgr8,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelEncoding {
    /// Worst-case byte size of one frame at the given resolution. Pool slots
    /// are sized with this so any frame of the negotiated format fits.
    #[must_use]
    pub fn bytes_per_frame(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelEncoding::Mono8 => pixels,
            PixelEncoding::Rgb8 | PixelEncoding::Bgr8 => pixels * 3,
            // MJPEG is compressed, but hardware is allowed to emit frames up
            // to the uncompressed YUV 4:2:2 size.
            PixelEncoding::Yuyv | PixelEncoding::Mjpeg => pixels * 2,
            PixelEncoding::Nv12 => pixels * 3 / 2,
        }
    }
}

impl Display for PixelEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One concrete video format: the single negotiated configuration of an
/// active stream, fixed until the stream is stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoFormat {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl VideoFormat {
    #[must_use]
    pub fn new(encoding: PixelEncoding, width: u32, height: u32, frame_rate: u32) -> Self {
        VideoFormat {
            encoding,
            width,
            height,
            frame_rate,
        }
    }

    /// Worst-case byte size of one frame of this format.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.encoding.bytes_per_frame(self.width, self.height)
    }
}

impl Display for VideoFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width, self.height, self.frame_rate, self.encoding
        )
    }
}

/// One entry of a device's format capability set: a resolution/encoding pair
/// with the discrete frame rates the hardware reports for it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoFormatDescription {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub frame_rates: Vec<u32>,
}

impl VideoFormatDescription {
    #[must_use]
    pub fn new(encoding: PixelEncoding, width: u32, height: u32, frame_rates: Vec<u32>) -> Self {
        VideoFormatDescription {
            encoding,
            width,
            height,
            frame_rates,
        }
    }

    /// Whether `format` falls inside this capability entry.
    #[must_use]
    pub fn supports(&self, format: &VideoFormat) -> bool {
        self.encoding == format.encoding
            && self.width == format.width
            && self.height == format.height
            && self.frame_rates.contains(&format.frame_rate)
    }

    fn pixel_area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// How a caller wants a format chosen from a device's capability set.
///
/// `fulfill` resolves the request against the reported capabilities before
/// the result is handed to the backend for negotiation, so callers get
/// predictable selection behavior no matter which transport is underneath.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatRequest {
    /// Exactly this format or nothing.
    Exact(VideoFormat),
    /// The capability entry closest to this format, same encoding required.
    Closest(VideoFormat),
    /// Largest pixel area in this encoding, fastest rate it offers.
    HighestResolution(PixelEncoding),
    /// Fastest frame rate in this encoding, largest area offering it.
    HighestFrameRate(PixelEncoding),
}

impl FormatRequest {
    /// Pick the format satisfying this request from `descriptions`.
    ///
    /// Returns `None` when nothing in the capability set satisfies the
    /// request, which callers surface as [`CamhubError::Unsupported`].
    #[must_use]
    pub fn fulfill(&self, descriptions: &[VideoFormatDescription]) -> Option<VideoFormat> {
        match self {
            FormatRequest::Exact(requested) => descriptions
                .iter()
                .any(|d| d.supports(requested))
                .then_some(*requested),
            FormatRequest::Closest(requested) => {
                let want_area = u64::from(requested.width) * u64::from(requested.height);
                let desc = descriptions
                    .iter()
                    .filter(|d| d.encoding == requested.encoding && !d.frame_rates.is_empty())
                    .min_by_key(|d| d.pixel_area().abs_diff(want_area))?;
                let rate = *desc
                    .frame_rates
                    .iter()
                    .min_by_key(|r| r.abs_diff(requested.frame_rate))?;
                Some(VideoFormat::new(
                    desc.encoding,
                    desc.width,
                    desc.height,
                    rate,
                ))
            }
            FormatRequest::HighestResolution(encoding) => {
                let desc = descriptions
                    .iter()
                    .filter(|d| d.encoding == *encoding && !d.frame_rates.is_empty())
                    .max_by_key(|d| d.pixel_area())?;
                let rate = *desc.frame_rates.iter().max()?;
                Some(VideoFormat::new(
                    desc.encoding,
                    desc.width,
                    desc.height,
                    rate,
                ))
            }
            FormatRequest::HighestFrameRate(encoding) => {
                let desc = descriptions
                    .iter()
                    .filter(|d| d.encoding == *encoding && !d.frame_rates.is_empty())
                    .max_by_key(|d| (d.frame_rates.iter().max().copied(), d.pixel_area()))?;
                let rate = *desc.frame_rates.iter().max()?;
                Some(VideoFormat::new(
                    desc.encoding,
                    desc.width,
                    desc.height,
                    rate,
                ))
            }
        }
    }
}

/// Transport precedence used by the device index to break ties between
/// sightings of the same physical device on different transports.
///
/// Earlier entries win. Transports missing from the list rank below every
/// listed one; among those, ties fall back to identifier ordering so the
/// outcome stays deterministic under any enumeration order.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportPriority(pub Vec<TransportType>);

impl TransportPriority {
    /// Rank of `transport`; lower is preferred.
    #[must_use]
    pub fn rank(&self, transport: TransportType) -> usize {
        self.0
            .iter()
            .position(|t| *t == transport)
            .unwrap_or(self.0.len())
    }
}

impl Default for TransportPriority {
    fn default() -> Self {
        TransportPriority(vec![
            TransportType::GigEVision,
            TransportType::Usb,
            TransportType::V4l2,
            TransportType::Virtual,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_descriptions() -> Vec<VideoFormatDescription> {
        vec![
            VideoFormatDescription::new(PixelEncoding::Yuyv, 640, 480, vec![15, 30, 60]),
            VideoFormatDescription::new(PixelEncoding::Yuyv, 1280, 720, vec![15, 30]),
            VideoFormatDescription::new(PixelEncoding::Mono8, 1280, 720, vec![60]),
        ]
    }

    #[test]
    fn transport_round_trips_through_str() {
        for t in [
            TransportType::GigEVision,
            TransportType::Usb,
            TransportType::V4l2,
            TransportType::Virtual,
        ] {
            assert_eq!(TransportType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(TransportType::from_str("firewire").is_err());
    }

    #[test]
    fn exact_request_needs_an_exact_match() {
        let descs = make_descriptions();
        let hit = VideoFormat::new(PixelEncoding::Yuyv, 1280, 720, 30);
        assert_eq!(FormatRequest::Exact(hit).fulfill(&descs), Some(hit));

        let miss = VideoFormat::new(PixelEncoding::Yuyv, 1920, 1080, 30);
        assert_eq!(FormatRequest::Exact(miss).fulfill(&descs), None);
    }

    #[test]
    fn closest_request_picks_nearest_area_and_rate() {
        let descs = make_descriptions();
        let requested = VideoFormat::new(PixelEncoding::Yuyv, 1920, 1080, 25);
        let chosen = FormatRequest::Closest(requested).fulfill(&descs).unwrap();
        assert_eq!(chosen, VideoFormat::new(PixelEncoding::Yuyv, 1280, 720, 30));
    }

    #[test]
    fn highest_resolution_respects_encoding() {
        let descs = make_descriptions();
        let chosen = FormatRequest::HighestResolution(PixelEncoding::Mono8)
            .fulfill(&descs)
            .unwrap();
        assert_eq!(
            chosen,
            VideoFormat::new(PixelEncoding::Mono8, 1280, 720, 60)
        );
    }

    #[test]
    fn priority_ranks_unlisted_transports_last() {
        let priority = TransportPriority(vec![TransportType::Usb, TransportType::GigEVision]);
        assert!(priority.rank(TransportType::Usb) < priority.rank(TransportType::GigEVision));
        assert!(priority.rank(TransportType::GigEVision) < priority.rank(TransportType::V4l2));
        assert_eq!(
            priority.rank(TransportType::V4l2),
            priority.rank(TransportType::Virtual)
        );
    }

    #[test]
    fn frame_sizing_matches_encoding() {
        assert_eq!(PixelEncoding::Mono8.bytes_per_frame(640, 480), 640 * 480);
        assert_eq!(PixelEncoding::Rgb8.bytes_per_frame(640, 480), 640 * 480 * 3);
        assert_eq!(PixelEncoding::Nv12.bytes_per_frame(640, 480), 640 * 480 * 3 / 2);
    }
}
