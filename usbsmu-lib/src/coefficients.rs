use crate::error::Result;
use crate::quantity::Quantity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Calibration parameter values keyed by parameter name.
///
/// Serialized as a flat JSON object with string-encoded decimals, e.g.
/// `{"Cal Voltage Meas Factor": "1.00213"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoefficientSet(BTreeMap<Quantity, Decimal>);

impl CoefficientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, quantity: Quantity, value: Decimal) -> Option<Decimal> {
        self.0.insert(quantity, value)
    }

    pub fn get(&self, quantity: &Quantity) -> Option<Decimal> {
        self.0.get(quantity).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Quantity, &Decimal)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Quantity> {
        self.0.keys()
    }

    /// Read a set previously written by [`CoefficientSet::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

impl FromIterator<(Quantity, Decimal)> for CoefficientSet {
    fn from_iter<I: IntoIterator<Item = (Quantity, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for CoefficientSet {
    type Item = (Quantity, Decimal);
    type IntoIter = std::collections::btree_map::IntoIter<Quantity, Decimal>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for CoefficientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            writeln!(f, "  {name}: {value}")?;
        }
        Ok(())
    }
}

/// MAC address as used in per-device file names: colons removed, lower-cased.
pub fn mac_postfix(mac: &str) -> String {
    mac.replace(':', "").to_lowercase()
}

/// Per-device file name, e.g. `cal_aabbcc001122.json`.
pub fn device_file_name(prefix: &str, mac: &str, extension: &str) -> String {
    format!("{}_{}.{}", prefix, mac_postfix(mac), extension)
}
