// Device and tooling constants for the UsbSMU

use rust_decimal::Decimal;
use std::time::Duration;

/// Name prefix the firmware puts in front of every entity name
pub const DEFAULT_DEVICE_PREFIX: &str = "UsbSMU ";

/// Path of the sample log handler
pub const SAMPLES_PATH: &str = "/samples";

/// Settle delay used by the reference-meter calibrations
pub const MANUAL_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Settle delay used by the self-calibrations
pub const SELFCAL_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Ratio readbacks are centered on this value at zero output
pub const RATIO_MIDSCALE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Max spacing (ms) between samples merged into one logger row
pub const AGGREGATE_MILLIS: u64 = 150;

/// Logger CSV columns, first is seconds since the first sample
pub const LOGGER_COLUMNS: [&str; 5] = ["s", "V", "A", "Ah", "J"];

/// Logger columns that start a new row when overwritten
pub const NEW_ROW_COLUMNS: [&str; 2] = ["V", "A"];

/// Default CSV file written by the calibration procedures
pub const CALIBRATION_CSV: &str = "calibration.csv";
