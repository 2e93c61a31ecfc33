//! Decoder for the drone's `key:value;` state datagrams

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::types::{FieldKind, TelemetrySnapshot, field_kind};

/// Turns raw state datagrams into rate-limited [`TelemetrySnapshot`]s.
///
/// A datagram is applied only when at least `min_interval` has passed since
/// the previous applied one and it changes at least one known field. Anything
/// else, malformed input included, is dropped silently.
#[derive(Debug)]
pub struct TelemetryDecoder {
    current: Arc<TelemetrySnapshot>,
    last_applied: Option<Instant>,
    min_interval: Duration,
}

impl TelemetryDecoder {
    pub fn new(min_interval: Duration) -> Self {
        Self { current: Arc::new(TelemetrySnapshot::default()), last_applied: None, min_interval }
    }

    /// The most recently applied snapshot.
    pub fn current(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.current)
    }

    /// Decode a datagram received now.
    pub fn decode(&mut self, datagram: &[u8]) -> Option<Arc<TelemetrySnapshot>> {
        self.decode_at(datagram, Instant::now(), Utc::now())
    }

    /// Decode a datagram received at `now`, stamping it with `wall_clock`.
    pub fn decode_at(
        &mut self,
        datagram: &[u8],
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> Option<Arc<TelemetrySnapshot>> {
        if let Some(last) = self.last_applied {
            if now.saturating_duration_since(last) < self.min_interval {
                trace!("Telemetry datagram inside rate limit window, dropped");
                return None;
            }
        }

        let text = std::str::from_utf8(datagram).ok()?;
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if text.is_empty() {
            return None;
        }

        let mut next = TelemetrySnapshot::clone(&self.current);
        let mut changed = false;

        for segment in text.split(';') {
            let Some((key, value)) = segment.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match field_kind(key) {
                Some(FieldKind::Int) => {
                    if let Some(value) = parse_int(value) {
                        changed |= next.set_int(key, value);
                    }
                }
                Some(FieldKind::Float) => {
                    if let Some(value) = value.parse::<f32>().ok().filter(|v| v.is_finite()) {
                        changed |= next.set_float(key, value);
                    }
                }
                None => {}
            }
        }

        if !changed {
            return None;
        }

        next.observed_at = Some(wall_clock);
        let snapshot = Arc::new(next);
        self.current = Arc::clone(&snapshot);
        self.last_applied = Some(now);
        Some(snapshot)
    }
}

/// Integers occasionally arrive as float literals; those are truncated.
fn parse_int(value: &str) -> Option<i32> {
    if let Ok(parsed) = value.parse::<i32>() {
        return Some(parsed);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= i32::MIN as f64 && *v <= i32::MAX as f64)
        .map(|v| v.trunc() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FULL_STATE: &[u8] = b"mid:-1;x:0;y:0;z:0;mpry:0,0,0;pitch:2;roll:-1;yaw:45;vgx:0;vgy:0;vgz:0;templ:60;temph:63;tof:10;h:0;bat:87;baro:182.35;time:0;agx:-5.00;agy:3.00;agz:-998.00;\r\n";

    fn decoder() -> TelemetryDecoder {
        TelemetryDecoder::new(Duration::from_millis(100))
    }

    #[test]
    fn decodes_partial_update_and_keeps_other_fields() {
        let mut decoder = decoder();
        let start = Instant::now();
        let wall = Utc::now();

        decoder.decode_at(FULL_STATE, start, wall).expect("first update applies");
        let snapshot = decoder
            .decode_at(b"bat:85;h:120;time:42;", start + Duration::from_millis(150), wall)
            .expect("second update applies");

        assert_eq!(snapshot.bat, 85);
        assert_eq!(snapshot.h, 120);
        assert_eq!(snapshot.time, 42);
        assert_eq!(snapshot.yaw, 45);
        assert_eq!(snapshot.templ, 60);
        assert_eq!(snapshot.observed_at, Some(wall));
    }

    #[test]
    fn decodes_full_device_datagram() {
        let mut decoder = decoder();
        let snapshot = decoder.decode(FULL_STATE).expect("applied");
        assert_eq!(snapshot.mid, -1);
        assert_eq!(snapshot.bat, 87);
        assert_eq!(snapshot.tof, 10);
        assert!((snapshot.baro - 182.35).abs() < 1e-4);
        assert!((snapshot.agz + 998.0).abs() < 1e-4);
        assert!(snapshot.observed_at.is_some());
    }

    #[test]
    fn update_inside_interval_is_dropped() {
        let mut decoder = decoder();
        let start = Instant::now();
        let first = decoder.decode_at(b"bat:90;", start, Utc::now()).expect("applied");

        let dropped = decoder.decode_at(b"bat:89;", start + Duration::from_millis(50), Utc::now());
        assert!(dropped.is_none());
        assert_eq!(decoder.current(), first);
        assert_eq!(decoder.current().bat, 90);
    }

    #[test]
    fn unchanged_update_is_not_published() {
        let mut decoder = decoder();
        let start = Instant::now();
        decoder.decode_at(b"bat:90;h:10;", start, Utc::now()).expect("applied");
        let later = start + Duration::from_millis(500);
        assert!(decoder.decode_at(b"bat:90;h:10;", later, Utc::now()).is_none());

        // The window is measured from the last applied update, so a change right after still lands
        let applied = decoder.decode_at(b"bat:89;", later + Duration::from_millis(1), Utc::now());
        assert_eq!(applied.map(|s| s.bat), Some(89));
    }

    #[test]
    fn malformed_datagrams_are_ignored() {
        let mut decoder = decoder();
        assert!(decoder.decode(b"").is_none());
        assert!(decoder.decode(b";;;").is_none());
        assert!(decoder.decode(&[0xff, 0x00, 0x9c]).is_none());
        assert!(decoder.decode(b"bat;h=3;wifi:90;").is_none());
        assert!(decoder.decode(b"bat:full;baro:NaN;").is_none());
        assert_eq!(*decoder.current(), TelemetrySnapshot::default());
    }

    #[test]
    fn float_literal_for_integer_field_is_truncated() {
        let mut decoder = decoder();
        let snapshot = decoder.decode(b"h:120.7;").expect("applied");
        assert_eq!(snapshot.h, 120);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut decoder = decoder();
            let _ = decoder.decode(&bytes);
        }

        #[test]
        fn generated_fields_round_into_snapshot(bat in 0i32..=100, h in -500i32..3000, baro in -100.0f32..5000.0) {
            let mut decoder = decoder();
            let datagram = format!("bat:{bat};h:{h};baro:{baro};");
            if let Some(snapshot) = decoder.decode(datagram.as_bytes()) {
                prop_assert_eq!(snapshot.bat, bat);
                prop_assert_eq!(snapshot.h, h);
                prop_assert_eq!(snapshot.baro, baro);
            } else {
                // Only possible when every generated value equals the default
                prop_assert!(bat == 0 && h == 0 && baro == 0.0);
            }
        }
    }
}
