// crates/klip-core/src/ingest.rs
//
// The single boundary conversion between the wire's scaled-integer
// convention and the core's internal f64 units. Everything past this
// module deals only in seconds and normalised ratios; nothing downstream
// ever sees a wire-scaled integer again.
//
// Two conventions are in play, named in spec.md §6:
//   - `millis`: `offset`/`sourceOffset`/`duration` travel as whole
//     milliseconds; the core stores seconds (`/ 1000`).
//   - `scaled100`: `opacity`, `gain`, `pan`, `speed`, `x`, `y`, `width`,
//     `height`, `gap`, `padding` travel as `floor(value * 100)`; the core
//     stores the unscaled ratio (`/ 100`).
// Both are exposed as plain functions (for call sites that already hold a
// raw integer) and as `serde(with = "...")` modules (for fields on
// `model::*` deserialised directly off the wire).

/// Convert a wire-scaled integer (`opacity`, `gain`, `pan`, `speed`, `x`,
/// `y`, `width`, `height`, `gap`, `padding`) to its normalised f64 value.
///
/// ```
/// use klip_core::ingest::unscale;
/// assert_eq!(unscale(50), 0.5);
/// assert_eq!(unscale(100), 1.0);
/// ```
pub fn unscale(value: i64) -> f64 {
    value as f64 / 100.0
}

/// Inverse of [`unscale`], rounding toward the nearest wire integer.
///
/// ```
/// use klip_core::ingest::scale;
/// assert_eq!(scale(0.5), 50);
/// assert_eq!(scale(1.0), 100);
/// ```
pub fn scale(value: f64) -> i64 {
    (value * 100.0).floor() as i64
}

/// Convert a wire millisecond count to seconds.
///
/// ```
/// use klip_core::ingest::ms_to_secs;
/// assert_eq!(ms_to_secs(1500), 1.5);
/// ```
pub fn ms_to_secs(value: i64) -> f64 {
    value as f64 / 1000.0
}

/// Inverse of [`ms_to_secs`], rounding toward the nearest millisecond.
pub fn secs_to_ms(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

/// `serde(with = "crate::ingest::scaled100")` for a plain `f64` field whose
/// wire representation is `floor(value * 100)`.
pub mod scaled100 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(super::scale(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(super::unscale(i64::deserialize(deserializer)?))
    }
}

/// `serde(with = "crate::ingest::scaled100_f32")` — same convention, for an
/// `f32` field (e.g. `AudioEffect::Gain`/`Pan`).
pub mod scaled100_f32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(super::scale(*value as f64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(super::unscale(i64::deserialize(deserializer)?) as f32)
    }
}

/// `serde(with = "crate::ingest::millis")` for a plain `f64` field whose
/// wire representation is a whole millisecond count.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(super::secs_to_ms(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(super::ms_to_secs(i64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wire {
        #[serde(with = "scaled100")]
        pan: f64,
        #[serde(with = "millis")]
        offset_ms: f64,
    }

    #[test]
    fn round_trips_through_wire_shape() {
        let json = serde_json::json!({"pan": -50, "offset_ms": 2500});
        let w: Wire = serde_json::from_value(json).unwrap();
        assert_eq!(w.pan, -0.5);
        assert_eq!(w.offset_ms, 2.5);

        let back = serde_json::to_value(&w).unwrap();
        assert_eq!(back["pan"], -50);
        assert_eq!(back["offset_ms"], 2500);
    }
}
