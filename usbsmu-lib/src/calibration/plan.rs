//! Operating-point tables for the calibration procedures.
//!
//! Each plan has built-in defaults and can be loaded from JSON to override
//! them. Fields a file leaves out keep the values of the plan it is loaded
//! over, so a file only needs to name what it changes:
//!
//! ```json
//! { "coarse": ["1", "5"], "fine": ["-0.4", "0", "0.4"] }
//! ```

use crate::constants::{MANUAL_SETTLE_DELAY, SELFCAL_SETTLE_DELAY};
use crate::error::{Result, SmuError};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Setpoints applied before a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub voltage: Decimal,
    pub current_min: Decimal,
    pub current_max: Decimal,
}

impl OperatingPoint {
    pub fn new(voltage: Decimal, current_min: Decimal, current_max: Decimal) -> Self {
        Self {
            voltage,
            current_min,
            current_max,
        }
    }
}

impl fmt::Display for OperatingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.voltage, self.current_min, self.current_max)
    }
}

/// A step of a reference-meter calibration: either something the operator has
/// to do, or a point to measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanStep {
    Instruction(String),
    Point(OperatingPoint),
}

/// Load a plan from a JSON object file, on top of `base`.
pub fn load_plan<P: Serialize + DeserializeOwned>(path: impl AsRef<Path>, base: &P) -> Result<P> {
    let text = fs::read_to_string(path)?;
    overlay(base, serde_json::from_str(&text)?)
}

fn overlay<P: Serialize + DeserializeOwned>(base: &P, overrides: Value) -> Result<P> {
    let mut merged = serde_json::to_value(base)?;
    match (&mut merged, overrides) {
        (Value::Object(fields), Value::Object(overrides)) => fields.extend(overrides),
        (_, other) => {
            return Err(SmuError::validation(format!("plan must be a JSON object, got: {other}")));
        }
    }
    Ok(serde_json::from_value(merged)?)
}

fn d(mantissa: i64, scale: u32) -> Decimal {
    Decimal::new(mantissa, scale)
}

fn point(voltage: Decimal, current_min: Decimal, current_max: Decimal) -> PlanStep {
    PlanStep::Point(OperatingPoint::new(voltage, current_min, current_max))
}

fn millis(delay: Duration) -> u64 {
    delay.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageMeasPlan {
    pub settle_ms: u64,
    pub steps: Vec<PlanStep>,
}

impl Default for VoltageMeasPlan {
    fn default() -> Self {
        let limit = (d(-1, 1), d(1, 1));
        // Zero is skipped, it may be off-scale in output mode
        let mut steps = vec![PlanStep::Instruction("Open load".to_string())];
        steps.extend([1, 2, 4, 10, 14, 18].map(|v| point(d(v, 0), limit.0, limit.1)));
        Self {
            settle_ms: millis(MANUAL_SETTLE_DELAY),
            steps,
        }
    }
}

/// Steps for one current range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentRangePlan {
    pub steps: Vec<PlanStep>,
}

/// Per-range tables for the current calibration, indexed by range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentPlan {
    pub settle_ms: u64,
    pub ranges: Vec<CurrentRangePlan>,
}

impl Default for CurrentPlan {
    fn default() -> Self {
        let sink = d(-1, 1);
        let high = CurrentRangePlan {
            steps: vec![
                PlanStep::Instruction("Connect 4-ohm load".to_string()),
                point(d(1, 0), sink, d(1, 1)),
                point(d(3, 0), sink, d(5, 1)),
                point(d(5, 0), sink, d(1, 0)),
                point(d(7, 0), sink, d(15, 1)),
                point(d(9, 0), sink, d(2, 0)),
            ],
        };
        let low = CurrentRangePlan {
            steps: vec![
                PlanStep::Instruction("Connect 50-ohm load".to_string()),
                point(d(3, 0), sink, d(2, 2)),
                point(d(3, 0), sink, d(4, 2)),
                point(d(6, 0), sink, d(1, 1)),
                point(d(85, 1), sink, d(15, 2)),
                point(d(11, 0), sink, d(2, 1)),
                point(d(135, 1), sink, d(25, 2)),
            ],
        };
        Self {
            settle_ms: millis(MANUAL_SETTLE_DELAY),
            ranges: vec![high, low],
        }
    }
}

/// Coarse voltage setpoints crossed with fine adjustments, used by both
/// voltage-setpoint self-calibrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfCalVoltagePlan {
    pub settle_ms: u64,
    pub range: String,
    pub current_min: Decimal,
    pub current_max: Decimal,
    pub coarse: Vec<Decimal>,
    /// Fine DAC voltages, or fine ratios on ratio-readback devices.
    pub fine: Vec<Decimal>,
}

impl SelfCalVoltagePlan {
    fn with_fine(fine: Vec<Decimal>) -> Self {
        Self {
            settle_ms: millis(SELFCAL_SETTLE_DELAY),
            range: "3A".to_string(),
            current_min: d(-5, 2),
            current_max: d(5, 2),
            coarse: [1, 2, 4, 8, 12, 16, 20].map(|v| d(v, 0)).to_vec(),
            fine,
        }
    }

    /// Fine DAC voltages in volts.
    pub fn fine_dac() -> Self {
        Self::with_fine(vec![d(-25, 3), d(-15, 3), d(0, 0), d(15, 3), d(25, 3)])
    }

    /// Fine DAC settings as ratios of its full scale.
    pub fn fine_ratio() -> Self {
        Self::with_fine(vec![d(-4, 1), d(-25, 2), d(0, 0), d(25, 2), d(4, 1)])
    }
}

impl Default for SelfCalVoltagePlan {
    fn default() -> Self {
        Self::fine_ratio()
    }
}

/// Source current limits stepped at a fixed voltage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioCurrentPlan {
    pub settle_ms: u64,
    pub range: String,
    pub voltage: Decimal,
    pub current_min: Decimal,
    pub current_max: Vec<Decimal>,
}

impl Default for RatioCurrentPlan {
    fn default() -> Self {
        Self {
            settle_ms: millis(SELFCAL_SETTLE_DELAY),
            range: "3A".to_string(),
            voltage: d(2, 0),
            current_min: d(-1, 1),
            current_max: vec![d(1, 1), d(5, 1), d(1, 0), d(15, 1), d(2, 0)],
        }
    }
}

/// Points for the source/sink/common-mode current compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentCompPlan {
    pub settle_ms: u64,
    pub range: String,
    pub points: Vec<OperatingPoint>,
}

impl Default for CurrentCompPlan {
    fn default() -> Self {
        let table = [
            (0, -1, 1),
            (0, -1, 5),
            (0, -1, 10),
            (0, -1, 20),
            (0, -5, 1),
            (0, -10, 1),
            (0, -20, 1),
            (0, -10, 10),
            (0, -20, 10),
            (0, -10, 20),
            // common mode
            (2, -10, 10),
            (2, -20, 10),
            (2, -10, 20),
            (6, -10, 10),
            (6, -20, 10),
            (6, -10, 20),
        ];
        Self {
            settle_ms: millis(SELFCAL_SETTLE_DELAY),
            range: "3A".to_string(),
            points: table
                .into_iter()
                .map(|(v, min, max)| OperatingPoint::new(d(v, 0), d(min, 1), d(max, 1)))
                .collect(),
        }
    }
}

/// Voltage setpoints for the measurement/setpoint cross-term, run with output off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageCompPlan {
    pub settle_ms: u64,
    pub voltages: Vec<Decimal>,
}

impl Default for VoltageCompPlan {
    fn default() -> Self {
        Self {
            settle_ms: millis(SELFCAL_SETTLE_DELAY),
            voltages: [0, 5, 10, 15, 20].map(|v| d(v, 0)).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let volts = VoltageMeasPlan::default();
        assert_eq!(volts.steps.len(), 7);
        assert_eq!(volts.steps[0], PlanStep::Instruction("Open load".to_string()));
        assert_eq!(volts.settle_ms, 500);

        let amps = CurrentPlan::default();
        assert_eq!(amps.ranges[1].steps.len(), 7);
        assert_eq!(
            amps.ranges[1].steps[4],
            PlanStep::Point(OperatingPoint::new(d(85, 1), d(-1, 1), d(15, 2)))
        );

        let comp = CurrentCompPlan::default();
        assert_eq!(comp.points.len(), 16);
        assert_eq!(comp.points[15].to_string(), "(6, -1.0, 2.0)");
    }

    #[test]
    fn test_partial_override() {
        let plan: SelfCalVoltagePlan = serde_json::from_str(r#"{"coarse": ["1", "5"], "fine": [-0.4, 0, 0.4]}"#).unwrap();
        assert_eq!(plan.coarse, vec![d(1, 0), d(5, 0)]);
        assert_eq!(plan.fine.len(), 3);
        assert_eq!(plan.settle_ms, 300);
        assert_eq!(plan.range, "3A");
    }

    #[test]
    fn test_overlay_keeps_base_fields() {
        let base = SelfCalVoltagePlan::fine_dac();
        let plan = overlay(&base, serde_json::json!({ "coarse": ["1", "5"] })).unwrap();
        assert_eq!(plan.coarse, vec![d(1, 0), d(5, 0)]);
        assert_eq!(plan.fine, base.fine);

        let err = overlay(&base, serde_json::json!(["1"])).unwrap_err();
        assert!(matches!(err, SmuError::Validation(_)));
    }

    #[test]
    fn test_load_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volts.json");
        fs::write(&path, r#"{"settle_ms": 50}"#).unwrap();
        let plan = load_plan(&path, &VoltageMeasPlan::default()).unwrap();
        assert_eq!(plan.settle_ms, 50);
        assert_eq!(plan.steps.len(), 7);
    }

    #[test]
    fn test_steps_from_json() {
        let plan: VoltageMeasPlan = serde_json::from_str(
            r#"{"steps": ["Connect 50ohm", {"voltage": "1.0", "current_min": "-0.1", "current_max": "0.3"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(&plan.steps[0], PlanStep::Instruction(s) if s == "Connect 50ohm"));
        assert!(matches!(plan.steps[1], PlanStep::Point(p) if p.current_max == d(3, 1)));
    }
}
