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

//! The generic device-control model.
//!
//! Heterogeneous hardware controls (exposure, gain, trigger, ...) surface as
//! [`PropertyDescriptor`]s no matter which transport implements them. Ranges
//! are live data: hardware is allowed to shift a property's range or
//! writability as a side effect of another write (enabling auto-exposure
//! locks manual exposure, changing the frame rate moves the exposure limit),
//! so validation always runs against a freshly fetched descriptor.

use std::fmt::{self, Display, Formatter};

/// Names the backends in this workspace agree on for common controls.
/// Out-of-tree backends are free to expose additional, transport-specific
/// property names next to these.
pub mod wellknown {
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const AUTO_EXPOSURE: &str = "AutoExposure";
    pub const GAIN: &str = "Gain";
    pub const GAMMA: &str = "Gamma";
    pub const BRIGHTNESS: &str = "Brightness";
    pub const TRIGGER_MODE: &str = "TriggerMode";
}

/// Current value of one property.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Enumeration(String),
}

impl PropertyValue {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Float(_) => "float",
            PropertyValue::Enumeration(_) => "enumeration",
        }
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Boolean(v) => write!(f, "{v}"),
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Enumeration(v) => write!(f, "{v}"),
        }
    }
}

/// Value kind plus the currently valid range of one property.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyRange {
    Boolean {
        default: bool,
    },
    Integer {
        min: i64,
        max: i64,
        step: i64,
        default: i64,
    },
    Float {
        min: f64,
        max: f64,
        step: f64,
        default: f64,
    },
    Enumeration {
        variants: Vec<String>,
        default: String,
    },
}

impl PropertyRange {
    #[must_use]
    pub fn default_value(&self) -> PropertyValue {
        match self {
            PropertyRange::Boolean { default } => PropertyValue::Boolean(*default),
            PropertyRange::Integer { default, .. } => PropertyValue::Integer(*default),
            PropertyRange::Float { default, .. } => PropertyValue::Float(*default),
            PropertyRange::Enumeration { default, .. } => {
                PropertyValue::Enumeration(default.clone())
            }
        }
    }

    /// Checks `value` against this range. Kind mismatches and out-of-range
    /// values are rejected with a reason; values off the step grid pass,
    /// since hardware snaps those itself and the confirmed read-back reports
    /// what it settled on.
    pub fn validate(&self, value: &PropertyValue) -> Result<(), String> {
        match (self, value) {
            (PropertyRange::Boolean { .. }, PropertyValue::Boolean(_)) => Ok(()),
            (PropertyRange::Integer { min, max, .. }, PropertyValue::Integer(v)) => {
                if v < min || v > max {
                    Err(format!("out of range [{min}, {max}]"))
                } else {
                    Ok(())
                }
            }
            (PropertyRange::Float { min, max, .. }, PropertyValue::Float(v)) => {
                if !v.is_finite() {
                    Err("not a finite number".to_string())
                } else if v < min || v > max {
                    Err(format!("out of range [{min}, {max}]"))
                } else {
                    Ok(())
                }
            }
            (PropertyRange::Enumeration { variants, .. }, PropertyValue::Enumeration(v)) => {
                if variants.contains(v) {
                    Ok(())
                } else {
                    Err(format!("not one of {variants:?}"))
                }
            }
            (range, value) => Err(format!(
                "expected a {} value, got {}",
                range.default_value().kind(),
                value.kind()
            )),
        }
    }

    /// Snaps `value` into this range and onto the step grid, the way
    /// clamping hardware does. Kind mismatches fall back to the default.
    #[must_use]
    pub fn clamp(&self, value: &PropertyValue) -> PropertyValue {
        match (self, value) {
            (PropertyRange::Boolean { .. }, PropertyValue::Boolean(v)) => {
                PropertyValue::Boolean(*v)
            }
            (
                PropertyRange::Integer {
                    min, max, step, ..
                },
                PropertyValue::Integer(v),
            ) => {
                let clamped = (*v).clamp(*min, *max);
                let snapped = if *step > 1 {
                    min + ((clamped - min) / step) * step
                } else {
                    clamped
                };
                PropertyValue::Integer(snapped)
            }
            (
                PropertyRange::Float {
                    min, max, step, ..
                },
                PropertyValue::Float(v),
            ) => {
                let clamped = v.clamp(*min, *max);
                let snapped = if *step > 0.0 {
                    min + ((clamped - min) / step).round() * step
                } else {
                    clamped
                };
                PropertyValue::Float(snapped.clamp(*min, *max))
            }
            (PropertyRange::Enumeration { variants, default }, PropertyValue::Enumeration(v)) => {
                if variants.contains(v) {
                    PropertyValue::Enumeration(v.clone())
                } else {
                    PropertyValue::Enumeration(default.clone())
                }
            }
            (range, _) => range.default_value(),
        }
    }
}

/// Access mask of one property.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyFlags {
    pub readable: bool,
    pub writable: bool,
    /// Writes are rejected while the owning device is streaming.
    pub locked_while_streaming: bool,
}

impl PropertyFlags {
    #[must_use]
    pub fn read_write() -> Self {
        PropertyFlags {
            readable: true,
            writable: true,
            locked_while_streaming: false,
        }
    }

    #[must_use]
    pub fn read_only() -> Self {
        PropertyFlags {
            readable: true,
            writable: false,
            locked_while_streaming: false,
        }
    }

    #[must_use]
    pub fn locked_while_streaming(mut self) -> Self {
        self.locked_while_streaming = true;
        self
    }
}

/// Full description of one device control: name, current range, access mask,
/// and last known value.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyDescriptor {
    name: String,
    description: String,
    range: PropertyRange,
    flags: PropertyFlags,
    value: PropertyValue,
}

impl PropertyDescriptor {
    #[must_use]
    pub fn new(
        name: impl ToString,
        description: impl ToString,
        range: PropertyRange,
        flags: PropertyFlags,
    ) -> Self {
        let value = range.default_value();
        PropertyDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            range,
            flags,
            value,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn range(&self) -> &PropertyRange {
        &self.range
    }

    #[must_use]
    pub fn flags(&self) -> PropertyFlags {
        self.flags
    }

    #[must_use]
    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn set_value(&mut self, value: PropertyValue) {
        self.value = value;
    }

    pub fn set_flags(&mut self, flags: PropertyFlags) {
        self.flags = flags;
    }

    pub fn set_range(&mut self, range: PropertyRange) {
        self.range = range;
    }
}

impl Display for PropertyDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Broadcast to property observers after every successful write.
///
/// Carries a fresh descriptor snapshot so interdependent range and
/// writability shifts travel with the event that caused them.
#[derive(Clone, Debug)]
pub struct PropertyEvent {
    /// Name of the property that was written.
    pub name: String,
    /// The hardware-confirmed value after the write.
    pub value: PropertyValue,
    /// Descriptor snapshot taken after the write.
    pub properties: Vec<PropertyDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure_range() -> PropertyRange {
        PropertyRange::Float {
            min: 10.0,
            max: 30_000.0,
            step: 100.0,
            default: 10_000.0,
        }
    }

    #[test]
    fn validate_rejects_out_of_range_and_kind_mismatch() {
        let range = exposure_range();
        assert!(range.validate(&PropertyValue::Float(500.0)).is_ok());
        assert!(range.validate(&PropertyValue::Float(5.0)).is_err());
        assert!(range.validate(&PropertyValue::Float(f64::NAN)).is_err());
        assert!(range.validate(&PropertyValue::Integer(500)).is_err());
    }

    #[test]
    fn validate_allows_off_step_values() {
        // Hardware snaps these itself; local validation must not reject them.
        assert!(exposure_range().validate(&PropertyValue::Float(523.0)).is_ok());
    }

    #[test]
    fn clamp_snaps_to_step_grid() {
        let range = PropertyRange::Integer {
            min: 0,
            max: 255,
            step: 16,
            default: 128,
        };
        assert_eq!(range.clamp(&PropertyValue::Integer(37)), PropertyValue::Integer(32));
        assert_eq!(range.clamp(&PropertyValue::Integer(-4)), PropertyValue::Integer(0));
        assert_eq!(range.clamp(&PropertyValue::Integer(999)), PropertyValue::Integer(240));
    }

    #[test]
    fn clamp_falls_back_to_default_for_unknown_enum_variant() {
        let range = PropertyRange::Enumeration {
            variants: vec!["Off".to_string(), "On".to_string()],
            default: "Off".to_string(),
        };
        assert_eq!(
            range.clamp(&PropertyValue::Enumeration("Maybe".to_string())),
            PropertyValue::Enumeration("Off".to_string())
        );
    }

    #[test]
    fn descriptor_starts_at_the_range_default() {
        let desc = PropertyDescriptor::new(
            wellknown::EXPOSURE_TIME,
            "Exposure time in microseconds",
            exposure_range(),
            PropertyFlags::read_write(),
        );
        assert_eq!(desc.value(), &PropertyValue::Float(10_000.0));
        assert!(desc.flags().writable);
    }
}
