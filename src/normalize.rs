//! Maps firmware-specific reading payloads onto [`CanonicalReading`].
//!
//! Each canonical field has an ordered list of candidate keys; the first key
//! holding a usable value wins. Supporting a new firmware spelling is a
//! one-line change to [`FIELD_ALIASES`].
//!
//! | Field | Aliases (priority order) |
//! |---|---|
//! | `heart_rate` | `heart_rate`, `heartRate`, `bpm`, `hr` |
//! | `spo2` | `spo2`, `SpO2`, `oxygen` |
//! | `ir` | `ir`, `IR` |
//! | `red` | `red`, `RED` |

use serde_json::Value;

use crate::types::{CanonicalReading, RawReading};

/// Canonical field → candidate keys, highest priority first.
pub const FIELD_ALIASES: [(Field, &[&str]); 4] = [
    (Field::HeartRate, &["heart_rate", "heartRate", "bpm", "hr"]),
    (Field::Spo2, &["spo2", "SpO2", "oxygen"]),
    (Field::Ir, &["ir", "IR"]),
    (Field::Red, &["red", "RED"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    HeartRate,
    Spo2,
    Ir,
    Red,
}

/// Normalize one raw payload. Never fails: anything unusable becomes `0.0`.
pub fn normalize(raw: &RawReading) -> CanonicalReading {
    let mut out = CanonicalReading::default();
    for (field, aliases) in FIELD_ALIASES {
        let value = aliases
            .iter()
            .find_map(|key| raw.get(*key).and_then(usable))
            .unwrap_or(0.0);
        match field {
            Field::HeartRate => out.heart_rate = value,
            Field::Spo2 => out.spo2 = value,
            Field::Ir => out.ir = value,
            Field::Red => out.red = value,
        }
    }
    out
}

/// Normalize an arbitrary JSON body; non-objects yield an all-zero reading.
pub fn normalize_value(body: &Value) -> CanonicalReading {
    match body {
        Value::Object(map) => normalize(map),
        _ => CanonicalReading::default(),
    }
}

/// A candidate value is usable when it is a finite number above zero, given
/// either as a JSON number or a numeric string. Zero falls through to the
/// next alias.
fn usable(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n > 0.0).then_some(n)
}
