//! REST path segments for device entities.
//!
//! The firmware derives each entity's object id from its display name: the device
//! prefix is prepended, the result lower-cased, and whitespace turned into `_`.
//! Characters other than whitespace pass through untouched, so names containing
//! punctuation will not match the firmware's ids.

/// Derive the endpoint segment for a semantic name, e.g. `"Set Voltage"` with
/// prefix `"UsbSMU "` gives `"usbsmu_set_voltage"`.
pub fn endpoint_name(prefix: &str, name: &str) -> String {
    prefix
        .chars()
        .chain(name.chars())
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .flat_map(char::to_lowercase)
        .collect()
}
