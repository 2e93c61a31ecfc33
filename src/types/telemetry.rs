//! Typed telemetry snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric representation of a telemetry field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
}

/// Every key the decoder understands, with its coercion.
///
/// The snapshot shape is fixed: keys not listed here are ignored.
pub const TELEMETRY_FIELDS: &[(&str, FieldKind)] = &[
    ("mid", FieldKind::Int),
    ("x", FieldKind::Int),
    ("y", FieldKind::Int),
    ("z", FieldKind::Int),
    ("pitch", FieldKind::Int),
    ("roll", FieldKind::Int),
    ("yaw", FieldKind::Int),
    ("vgx", FieldKind::Int),
    ("vgy", FieldKind::Int),
    ("vgz", FieldKind::Int),
    ("templ", FieldKind::Int),
    ("temph", FieldKind::Int),
    ("tof", FieldKind::Int),
    ("h", FieldKind::Int),
    ("bat", FieldKind::Int),
    ("baro", FieldKind::Float),
    ("time", FieldKind::Int),
    ("agx", FieldKind::Float),
    ("agy", FieldKind::Float),
    ("agz", FieldKind::Float),
];

/// Look up the coercion for a telemetry key.
pub fn field_kind(key: &str) -> Option<FieldKind> {
    TELEMETRY_FIELDS.iter().find(|(name, _)| *name == key).map(|(_, kind)| *kind)
}

/// Immutable view of the drone state at one point in time.
///
/// Units follow the device: attitude in degrees, velocities in dm/s,
/// temperatures in °C, heights and time-of-flight in cm, barometer in m,
/// flight time in seconds, acceleration in 0.001g.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Mission pad id, -1 when none detected
    pub mid: i32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub pitch: i32,
    pub roll: i32,
    pub yaw: i32,
    pub vgx: i32,
    pub vgy: i32,
    pub vgz: i32,
    /// Lowest board temperature
    pub templ: i32,
    /// Highest board temperature
    pub temph: i32,
    pub tof: i32,
    /// Height above takeoff point
    pub h: i32,
    /// Battery percentage
    pub bat: i32,
    pub baro: f32,
    /// Motor-on time
    pub time: i32,
    pub agx: f32,
    pub agy: f32,
    pub agz: f32,
    /// Wall-clock time the snapshot was accepted, `None` before the first update
    pub observed_at: Option<DateTime<Utc>>,
}

impl TelemetrySnapshot {
    /// Set an integer field, returning whether its value changed.
    pub(crate) fn set_int(&mut self, key: &str, value: i32) -> bool {
        let Some(slot) = self.int_slot(key) else {
            return false;
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }

    /// Set a floating-point field, returning whether its value changed.
    pub(crate) fn set_float(&mut self, key: &str, value: f32) -> bool {
        let Some(slot) = self.float_slot(key) else {
            return false;
        };
        let changed = slot.to_bits() != value.to_bits();
        *slot = value;
        changed
    }

    fn int_slot(&mut self, key: &str) -> Option<&mut i32> {
        let slot = match key {
            "mid" => &mut self.mid,
            "x" => &mut self.x,
            "y" => &mut self.y,
            "z" => &mut self.z,
            "pitch" => &mut self.pitch,
            "roll" => &mut self.roll,
            "yaw" => &mut self.yaw,
            "vgx" => &mut self.vgx,
            "vgy" => &mut self.vgy,
            "vgz" => &mut self.vgz,
            "templ" => &mut self.templ,
            "temph" => &mut self.temph,
            "tof" => &mut self.tof,
            "h" => &mut self.h,
            "bat" => &mut self.bat,
            "time" => &mut self.time,
            _ => return None,
        };
        Some(slot)
    }

    fn float_slot(&mut self, key: &str) -> Option<&mut f32> {
        let slot = match key {
            "baro" => &mut self.baro,
            "agx" => &mut self.agx,
            "agy" => &mut self.agy,
            "agz" => &mut self.agz,
            _ => return None,
        };
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_field_has_a_slot() {
        let mut snapshot = TelemetrySnapshot::default();
        for (name, kind) in TELEMETRY_FIELDS {
            let changed = match kind {
                FieldKind::Int => snapshot.set_int(name, 7),
                FieldKind::Float => snapshot.set_float(name, 7.5),
            };
            assert!(changed, "field {name} was not settable");
        }
    }

    #[test]
    fn unchanged_value_reports_no_change() {
        let mut snapshot = TelemetrySnapshot::default();
        assert!(snapshot.set_int("bat", 85));
        assert!(!snapshot.set_int("bat", 85));
        assert!(snapshot.set_float("baro", 12.5));
        assert!(!snapshot.set_float("baro", 12.5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut snapshot = TelemetrySnapshot::default();
        assert_eq!(field_kind("wifi"), None);
        assert!(!snapshot.set_int("wifi", 1));
        assert!(!snapshot.set_float("bat", 1.0));
        assert_eq!(snapshot, TelemetrySnapshot::default());
    }
}
