//! Semantic device quantities and the per-generation tables that map them to
//! REST services.
//!
//! Each firmware generation exposes a different entity set. A [`QuantityTable`]
//! is built once for the generation in use and owns:
//! - which service (and therefore which access mode) backs each quantity,
//! - the closed list of calibration parameter names,
//! - how the active current range is chosen.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

/// A named device value, identified by its human-readable entity name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Cow<'static, str>);

impl Quantity {
    pub const MAC_WIFI: Quantity = Quantity::fixed("Mac Wifi");
    pub const CONFIG_CURRENT_RANGES: Quantity = Quantity::fixed("Config Current Ranges");

    pub const MEAS_VOLTAGE: Quantity = Quantity::fixed("Meas Voltage");
    pub const MEAS_CURRENT: Quantity = Quantity::fixed("Meas Current");
    pub const ADC_VOLTAGE: Quantity = Quantity::fixed("Meas ADC Voltage");
    pub const ADC_CURRENT: Quantity = Quantity::fixed("Meas ADC Current");
    pub const DERIV_POWER: Quantity = Quantity::fixed("Deriv Power");
    pub const DERIV_ENERGY: Quantity = Quantity::fixed("Deriv Energy");

    pub const SET_VOLTAGE: Quantity = Quantity::fixed("Set Voltage");
    pub const SET_VOLTAGE_FINE: Quantity = Quantity::fixed("Set Voltage Fine");
    pub const SET_CURRENT_MIN: Quantity = Quantity::fixed("Set Current Min");
    pub const SET_CURRENT_MAX: Quantity = Quantity::fixed("Set Current Max");

    // Quantized setpoints as actually programmed into the DACs
    pub const READBACK_VOLTAGE: Quantity = Quantity::fixed("Readback Voltage");
    pub const READBACK_VOLTAGE_FINE: Quantity = Quantity::fixed("Readback Voltage Fine");
    pub const READBACK_CURRENT_MIN: Quantity = Quantity::fixed("Readback Current Min");
    pub const READBACK_CURRENT_MAX: Quantity = Quantity::fixed("Readback Current Max");

    // Full-scale ratios used by self-calibration
    pub const MEAS_RATIO_VOLTAGE: Quantity = Quantity::fixed("Meas Ratio Voltage");
    pub const MEAS_RATIO_CURRENT: Quantity = Quantity::fixed("Meas Ratio Current");
    pub const SET_RATIO_VOLTAGE: Quantity = Quantity::fixed("Set Ratio Voltage");
    pub const SET_RATIO_VOLTAGE_FINE: Quantity = Quantity::fixed("Set Ratio Voltage Fine");
    pub const SET_RATIO_CURRENT_MIN: Quantity = Quantity::fixed("Set Ratio Current Min");
    pub const SET_RATIO_CURRENT_MAX: Quantity = Quantity::fixed("Set Ratio Current Max");

    pub const CAL_VOLTAGE_MEAS_FACTOR: Quantity = Quantity::fixed("Cal Voltage Meas Factor");
    pub const CAL_VOLTAGE_MEAS_OFFSET: Quantity = Quantity::fixed("Cal Voltage Meas Offset");
    pub const CAL_VOLTAGE_SET_FACTOR: Quantity = Quantity::fixed("Cal Voltage Set Factor");
    pub const CAL_VOLTAGE_SET_OFFSET: Quantity = Quantity::fixed("Cal Voltage Set Offset");
    pub const CAL_VOLTAGE_FINE_SET_FACTOR: Quantity = Quantity::fixed("Cal Voltage Fine Set Factor");
    pub const CAL_VOLTAGE_MEAS_SET_FACTOR: Quantity = Quantity::fixed("Cal Voltage Meas Set Factor");
    pub const CAL_CURRENT_SET_FACTOR: Quantity = Quantity::fixed("Cal Current Set Factor");
    pub const CAL_CURRENT_SET_OFFSET: Quantity = Quantity::fixed("Cal Current Set Offset");
    pub const CAL_CURRENT_SET_SOURCE_FACTOR: Quantity = Quantity::fixed("Cal Current Set Source Factor");
    pub const CAL_CURRENT_SET_SINK_FACTOR: Quantity = Quantity::fixed("Cal Current Set Sink Factor");
    pub const CAL_CURRENT_COMMON_FACTOR: Quantity = Quantity::fixed("Cal Current Common Factor");

    const fn fixed(name: &'static str) -> Self {
        Quantity(Cow::Borrowed(name))
    }

    /// A quantity by arbitrary name, e.g. a key read from a calibration file.
    pub fn named(name: impl Into<String>) -> Self {
        Quantity(Cow::Owned(name.into()))
    }

    /// Switch enabling the output on one current range (first generation only).
    pub fn enable_range(range: usize) -> Self {
        Quantity::named(format!("Range{range}"))
    }

    pub fn cal_current_meas_factor(range: usize) -> Self {
        Quantity::named(format!("Cal Current{range} Meas Factor"))
    }

    pub fn cal_current_meas_offset(range: usize) -> Self {
        Quantity::named(format!("Cal Current{range} Meas Offset"))
    }

    pub fn cal_current_set_factor(range: usize) -> Self {
        Quantity::named(format!("Cal Current{range} Set Factor"))
    }

    pub fn cal_current_set_offset(range: usize) -> Self {
        Quantity::named(format!("Cal Current{range} Set Offset"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// REST service category an entity lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    Sensor,
    TextSensor,
    Number,
    Switch,
    Select,
}

/// What a client may do with an entity. Only `ReadWrite` entities take a value,
/// `Action` entities take a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    Action,
}

impl Service {
    pub fn access(self) -> Access {
        match self {
            Service::Sensor | Service::TextSensor => Access::ReadOnly,
            Service::Number => Access::ReadWrite,
            Service::Switch | Service::Select => Access::Action,
        }
    }
}

/// Firmware generations of the UsbSMU, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceGeneration {
    /// Two current ranges, each enabled by its own switch.
    DualSwitch,
    /// Range select entity, fine voltage DAC and setpoint readbacks.
    FineDac,
    /// Ratio readbacks for self-calibration and source/sink/common-mode terms.
    #[default]
    RatioSelfCal,
}

impl DeviceGeneration {
    pub const ALL: [DeviceGeneration; 3] = [
        DeviceGeneration::DualSwitch,
        DeviceGeneration::FineDac,
        DeviceGeneration::RatioSelfCal,
    ];
}

impl FromStr for DeviceGeneration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown device generation '{s}'"))
    }
}

/// How the active current range is chosen when the output is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeControl {
    /// One switch per range; turning one on selects it.
    SwitchPerRange(Vec<Quantity>),
    /// A select entity picks the range and a single switch enables the output.
    Select { select: Quantity, enable: Quantity },
}

/// Versioned lookup table for one device generation.
#[derive(Debug, Clone)]
pub struct QuantityTable {
    generation: DeviceGeneration,
    services: BTreeMap<Quantity, Service>,
    calibration: Vec<Quantity>,
    ranges: Vec<String>,
    range_control: RangeControl,
}

impl QuantityTable {
    pub fn for_generation(generation: DeviceGeneration) -> Self {
        match generation {
            DeviceGeneration::DualSwitch => Self::dual_switch(),
            DeviceGeneration::FineDac => Self::fine_dac(),
            DeviceGeneration::RatioSelfCal => Self::ratio_self_cal(),
        }
    }

    fn base(generation: DeviceGeneration, ranges: &[&str], range_control: RangeControl) -> Self {
        let mut table = Self {
            generation,
            services: BTreeMap::new(),
            calibration: Vec::new(),
            ranges: ranges.iter().map(|r| r.to_string()).collect(),
            range_control,
        };
        table.add(Quantity::MAC_WIFI, Service::TextSensor);
        for q in [
            Quantity::MEAS_VOLTAGE,
            Quantity::MEAS_CURRENT,
            Quantity::DERIV_POWER,
            Quantity::DERIV_ENERGY,
        ] {
            table.add(q, Service::Sensor);
        }
        for q in [Quantity::SET_VOLTAGE, Quantity::SET_CURRENT_MIN, Quantity::SET_CURRENT_MAX] {
            table.add(q, Service::Number);
        }
        match table.range_control.clone() {
            RangeControl::SwitchPerRange(switches) => {
                for s in switches {
                    table.add(s, Service::Switch);
                }
            }
            RangeControl::Select { select, enable } => {
                table.add(select, Service::Select);
                table.add(enable, Service::Switch);
            }
        }
        table
    }

    fn dual_switch() -> Self {
        let mut table = Self::base(
            DeviceGeneration::DualSwitch,
            &["3A", "300mA"],
            RangeControl::SwitchPerRange(vec![Quantity::enable_range(0), Quantity::enable_range(1)]),
        );
        table.add(Quantity::CONFIG_CURRENT_RANGES, Service::Number);
        table.add(Quantity::ADC_VOLTAGE, Service::Sensor);
        table.add(Quantity::ADC_CURRENT, Service::Sensor);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_OFFSET);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_OFFSET);
        table.add_per_range_current_calibration(true);
        table
    }

    fn fine_dac() -> Self {
        let mut table = Self::base(DeviceGeneration::FineDac, &["3A", "300mA"], Self::select_control());
        table.add(Quantity::ADC_VOLTAGE, Service::Sensor);
        table.add(Quantity::ADC_CURRENT, Service::Sensor);
        table.add(Quantity::SET_VOLTAGE_FINE, Service::Number);
        for q in [
            Quantity::READBACK_VOLTAGE,
            Quantity::READBACK_VOLTAGE_FINE,
            Quantity::READBACK_CURRENT_MIN,
            Quantity::READBACK_CURRENT_MAX,
        ] {
            table.add(q, Service::Sensor);
        }
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_OFFSET);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_OFFSET);
        table.add_calibration(Quantity::CAL_VOLTAGE_FINE_SET_FACTOR);
        table.add_per_range_current_calibration(true);
        table
    }

    fn ratio_self_cal() -> Self {
        let mut table = Self::base(
            DeviceGeneration::RatioSelfCal,
            &["3A", "300mA", "30mA"],
            Self::select_control(),
        );
        for q in [
            Quantity::MEAS_RATIO_VOLTAGE,
            Quantity::MEAS_RATIO_CURRENT,
            Quantity::SET_RATIO_VOLTAGE,
            Quantity::SET_RATIO_CURRENT_MIN,
            Quantity::SET_RATIO_CURRENT_MAX,
        ] {
            table.add(q, Service::Sensor);
        }
        table.add(Quantity::SET_RATIO_VOLTAGE_FINE, Service::Number);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_OFFSET);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_SET_OFFSET);
        table.add_calibration(Quantity::CAL_VOLTAGE_FINE_SET_FACTOR);
        table.add_calibration(Quantity::CAL_VOLTAGE_MEAS_SET_FACTOR);
        table.add_per_range_current_calibration(false);
        table.add_calibration(Quantity::CAL_CURRENT_SET_FACTOR);
        table.add_calibration(Quantity::CAL_CURRENT_SET_OFFSET);
        table.add_calibration(Quantity::CAL_CURRENT_SET_SOURCE_FACTOR);
        table.add_calibration(Quantity::CAL_CURRENT_SET_SINK_FACTOR);
        table.add_calibration(Quantity::CAL_CURRENT_COMMON_FACTOR);
        table
    }

    fn select_control() -> RangeControl {
        RangeControl::Select {
            select: Quantity::fixed("Range"),
            enable: Quantity::fixed("Enable"),
        }
    }

    fn add(&mut self, quantity: Quantity, service: Service) {
        self.services.insert(quantity, service);
    }

    fn add_calibration(&mut self, quantity: Quantity) {
        self.add(quantity.clone(), Service::Number);
        self.calibration.push(quantity);
    }

    fn add_per_range_current_calibration(&mut self, with_set: bool) {
        let ranges = self.ranges.len();
        for r in 0..ranges {
            self.add_calibration(Quantity::cal_current_meas_factor(r));
        }
        for r in 0..ranges {
            self.add_calibration(Quantity::cal_current_meas_offset(r));
        }
        if with_set {
            for r in 0..ranges {
                self.add_calibration(Quantity::cal_current_set_factor(r));
            }
            for r in 0..ranges {
                self.add_calibration(Quantity::cal_current_set_offset(r));
            }
        }
    }

    pub fn generation(&self) -> DeviceGeneration {
        self.generation
    }

    /// Service backing `quantity`, or `None` if this generation lacks it.
    pub fn service(&self, quantity: &Quantity) -> Option<Service> {
        self.services.get(quantity).copied()
    }

    pub fn supports(&self, quantity: &Quantity) -> bool {
        self.services.contains_key(quantity)
    }

    /// Every quantity this generation exposes, with its service.
    pub fn entries(&self) -> impl Iterator<Item = (&Quantity, Service)> {
        self.services.iter().map(|(q, s)| (q, *s))
    }

    /// The closed set of calibration parameter names, in display order.
    pub fn calibration_names(&self) -> &[Quantity] {
        &self.calibration
    }

    pub fn is_calibration(&self, quantity: &Quantity) -> bool {
        self.calibration.contains(quantity)
    }

    /// Current range labels, index 0 is the highest range.
    pub fn ranges(&self) -> &[String] {
        &self.ranges
    }

    /// Index of a range label such as `"3A"`.
    pub fn range_index(&self, label: &str) -> Option<usize> {
        self.ranges.iter().position(|r| r.eq_ignore_ascii_case(label))
    }

    pub fn range_control(&self) -> &RangeControl {
        &self.range_control
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(Service::TextSensor.to_string(), "text_sensor");
        assert_eq!(Service::Number.to_string(), "number");
        assert_eq!(Service::Select.to_string(), "select");
    }

    #[test]
    fn test_service_access() {
        assert_eq!(Service::Sensor.access(), Access::ReadOnly);
        assert_eq!(Service::TextSensor.access(), Access::ReadOnly);
        assert_eq!(Service::Number.access(), Access::ReadWrite);
        assert_eq!(Service::Switch.access(), Access::Action);
        assert_eq!(Service::Select.access(), Access::Action);
    }

    #[test]
    fn test_dual_switch_calibration_set() {
        let table = QuantityTable::for_generation(DeviceGeneration::DualSwitch);
        let names: Vec<&str> = table.calibration_names().iter().map(Quantity::name).collect();
        assert_eq!(
            names,
            [
                "Cal Voltage Meas Factor",
                "Cal Voltage Meas Offset",
                "Cal Voltage Set Factor",
                "Cal Voltage Set Offset",
                "Cal Current0 Meas Factor",
                "Cal Current1 Meas Factor",
                "Cal Current0 Meas Offset",
                "Cal Current1 Meas Offset",
                "Cal Current0 Set Factor",
                "Cal Current1 Set Factor",
                "Cal Current0 Set Offset",
                "Cal Current1 Set Offset",
            ]
        );
        assert!(!table.supports(&Quantity::SET_VOLTAGE_FINE));
        assert_eq!(table.service(&Quantity::enable_range(1)), Some(Service::Switch));
    }

    #[test]
    fn test_generations_differ() {
        let fine = QuantityTable::for_generation(DeviceGeneration::FineDac);
        assert!(fine.is_calibration(&Quantity::CAL_VOLTAGE_FINE_SET_FACTOR));
        assert!(!fine.is_calibration(&Quantity::CAL_CURRENT_COMMON_FACTOR));

        let ratio = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        assert_eq!(ratio.ranges().len(), 3);
        assert!(ratio.is_calibration(&Quantity::CAL_CURRENT_SET_SOURCE_FACTOR));
        assert!(ratio.is_calibration(&Quantity::cal_current_meas_offset(2)));
        assert!(!ratio.is_calibration(&Quantity::cal_current_set_factor(0)));
        assert_eq!(ratio.service(&Quantity::SET_RATIO_VOLTAGE_FINE), Some(Service::Number));
        assert_eq!(ratio.range_index("300ma"), Some(1));
        assert_eq!(ratio.range_index("10A"), None);
    }

    #[test]
    fn test_owned_and_borrowed_names_compare_equal() {
        assert_eq!(Quantity::named("Meas Voltage"), Quantity::MEAS_VOLTAGE);
        assert_eq!("ratio-self-cal".parse::<DeviceGeneration>().unwrap(), DeviceGeneration::RatioSelfCal);
        assert_eq!(DeviceGeneration::FineDac.to_string(), "fine-dac");
    }
}
