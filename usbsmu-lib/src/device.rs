use crate::codec::{decode_state, decode_text, decode_value, encode_decimal};
use crate::coefficients::CoefficientSet;
use crate::constants::DEFAULT_DEVICE_PREFIX;
use crate::endpoint::endpoint_name;
use crate::error::{Result, SmuError};
use crate::quantity::{Access, DeviceGeneration, Quantity, QuantityTable, RangeControl, Service};
use crate::samples::SampleBuffer;
use crate::transport::{HttpTransport, Reply, Transport};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Setpoints as actually programmed, read back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointReadback {
    pub voltage: Decimal,
    pub voltage_fine: Decimal,
    pub current_min: Decimal,
    pub current_max: Decimal,
}

/// Client for one UsbSMU at a known address.
///
/// Every operation is a sequence of awaited requests, one per quantity touched.
/// Failures are returned immediately and never retried. The device keeps output
/// and calibration state globally, so callers must not run two calibration
/// sessions against the same device at once.
pub struct Smu<T> {
    transport: T,
    table: QuantityTable,
    prefix: String,
}

impl Smu<HttpTransport> {
    /// Client for a device at `addr` (host or host:port) whose entities carry `prefix`.
    pub fn connect(addr: &str, generation: DeviceGeneration, prefix: &str) -> Result<Self> {
        info!(%addr, %generation, prefix, "Using UsbSMU");
        Ok(Self::with_prefix(HttpTransport::new(addr)?, generation, prefix))
    }
}

impl<T: Transport> Smu<T> {
    pub fn new(transport: T, generation: DeviceGeneration) -> Self {
        Self::with_prefix(transport, generation, DEFAULT_DEVICE_PREFIX)
    }

    pub fn with_prefix(transport: T, generation: DeviceGeneration, prefix: &str) -> Self {
        Self {
            transport,
            table: QuantityTable::for_generation(generation),
            prefix: prefix.to_string(),
        }
    }

    pub fn table(&self) -> &QuantityTable {
        &self.table
    }

    /// Start a sample stream over this device's sample log.
    pub fn sample_buffer(&self) -> SampleBuffer<'_, T> {
        SampleBuffer::new(&self.transport)
    }

    fn service_of(&self, quantity: &Quantity) -> Result<Service> {
        self.table.service(quantity).ok_or_else(|| {
            SmuError::validation(format!(
                "'{}' is not available on {} devices",
                quantity,
                self.table.generation()
            ))
        })
    }

    fn path(&self, service: Service, quantity: &Quantity) -> String {
        format!("/{}/{}", service, endpoint_name(&self.prefix, quantity.name()))
    }

    fn check(reply: Reply, path: &str) -> Result<String> {
        if reply.is_success() {
            Ok(reply.body)
        } else {
            Err(SmuError::Http {
                status: reply.status,
                path: path.to_string(),
            })
        }
    }

    async fn fetch(&self, service: Service, quantity: &Quantity) -> Result<String> {
        let path = self.path(service, quantity);
        let reply = self.transport.get(&path).await?;
        Self::check(reply, &path)
    }

    async fn action(&self, path: String) -> Result<()> {
        let reply = self.transport.post(&path).await?;
        Self::check(reply, &path)?;
        Ok(())
    }

    /// Read a numeric quantity: sensors through their `state`, numbers through their `value`.
    pub async fn get(&self, quantity: &Quantity) -> Result<Decimal> {
        let service = self.service_of(quantity)?;
        let value = match service {
            Service::Sensor => decode_state(&self.fetch(service, quantity).await?)?,
            Service::Number => decode_value(&self.fetch(service, quantity).await?)?,
            Service::TextSensor | Service::Switch | Service::Select => {
                return Err(SmuError::validation(format!(
                    "'{quantity}' is a {service} entity without a numeric value"
                )));
            }
        };
        debug!(%quantity, %value, "get");
        Ok(value)
    }

    /// Read a textual quantity.
    pub async fn get_text(&self, quantity: &Quantity) -> Result<String> {
        let service = self.service_of(quantity)?;
        if service != Service::TextSensor {
            return Err(SmuError::validation(format!("'{quantity}' is not a text sensor")));
        }
        decode_text(&self.fetch(service, quantity).await?)
    }

    /// Write a `number` quantity. Anything else is rejected before a request is made.
    pub async fn set(&self, quantity: &Quantity, value: Decimal) -> Result<()> {
        let service = self.service_of(quantity)?;
        if service.access() != Access::ReadWrite {
            return Err(SmuError::validation(format!(
                "'{quantity}' is a {service} entity and cannot be set"
            )));
        }
        debug!(%quantity, %value, "set");
        let path = format!("{}/set?value={}", self.path(service, quantity), encode_decimal(value));
        self.action(path).await
    }

    async fn switch(&self, quantity: &Quantity, on: bool) -> Result<()> {
        let service = self.service_of(quantity)?;
        if service.access() != Access::Action || service != Service::Switch {
            return Err(SmuError::validation(format!("'{quantity}' is not a switch")));
        }
        let verb = if on { "turn_on" } else { "turn_off" };
        self.action(format!("{}/{}", self.path(service, quantity), verb)).await
    }

    async fn select(&self, quantity: &Quantity, option: &str) -> Result<()> {
        let service = self.service_of(quantity)?;
        if service.access() != Access::Action || service != Service::Select {
            return Err(SmuError::validation(format!("'{quantity}' is not a select")));
        }
        self.action(format!("{}/set?option={}", self.path(service, quantity), option))
            .await
    }

    fn range_or_default<'a>(&'a self, range: Option<&'a str>) -> Result<(usize, &'a str)> {
        let label = match range {
            Some(label) => label,
            None => self
                .table
                .ranges()
                .first()
                .map(String::as_str)
                .ok_or_else(|| SmuError::validation("device has no current ranges"))?,
        };
        let index = self.table.range_index(label).ok_or_else(|| {
            SmuError::validation(format!(
                "invalid current range '{}', expected one of {:?}",
                label,
                self.table.ranges()
            ))
        })?;
        Ok((index, self.table.ranges()[index].as_str()))
    }

    /// Switch the output on in `range` (the highest range if `None`), or off.
    ///
    /// Enabling selects the range first and then issues the enable action.
    /// Disabling ignores `range` and always issues the disable action(s).
    pub async fn enable(&self, on: bool, range: Option<&str>) -> Result<()> {
        if !on {
            info!("Disabling output");
            return match self.table.range_control() {
                RangeControl::SwitchPerRange(switches) => {
                    for switch in switches {
                        self.switch(switch, false).await?;
                    }
                    Ok(())
                }
                RangeControl::Select { enable, .. } => self.switch(enable, false).await,
            };
        }

        let (index, label) = self.range_or_default(range)?;
        info!(range = label, "Enabling output");
        match self.table.range_control() {
            RangeControl::SwitchPerRange(switches) => self.switch(&switches[index], true).await,
            RangeControl::Select { select, enable } => {
                self.select(select, label).await?;
                self.switch(enable, true).await
            }
        }
    }

    pub async fn mac(&self) -> Result<String> {
        self.get_text(&Quantity::MAC_WIFI).await
    }

    pub async fn set_voltage(&self, voltage: Decimal) -> Result<()> {
        self.set(&Quantity::SET_VOLTAGE, voltage).await
    }

    pub async fn set_voltage_fine(&self, voltage: Decimal) -> Result<()> {
        self.set(&Quantity::SET_VOLTAGE_FINE, voltage).await
    }

    /// Set the sink (`min`) and source (`max`) current limits; `min` must be below `max`.
    pub async fn set_current_limits(&self, min: Decimal, max: Decimal) -> Result<()> {
        if min >= max {
            return Err(SmuError::validation(format!(
                "current min {min} must be below current max {max}"
            )));
        }
        self.set(&Quantity::SET_CURRENT_MIN, min).await?;
        self.set(&Quantity::SET_CURRENT_MAX, max).await
    }

    /// Measured (voltage, current).
    pub async fn voltage_current(&self) -> Result<(Decimal, Decimal)> {
        Ok((
            self.get(&Quantity::MEAS_VOLTAGE).await?,
            self.get(&Quantity::MEAS_CURRENT).await?,
        ))
    }

    /// Raw ADC counts for (voltage, current).
    pub async fn raw_voltage_current(&self) -> Result<(Decimal, Decimal)> {
        Ok((
            self.get(&Quantity::ADC_VOLTAGE).await?.trunc(),
            self.get(&Quantity::ADC_CURRENT).await?.trunc(),
        ))
    }

    pub async fn setpoint_readback(&self) -> Result<SetpointReadback> {
        Ok(SetpointReadback {
            voltage: self.get(&Quantity::READBACK_VOLTAGE).await?,
            voltage_fine: self.get(&Quantity::READBACK_VOLTAGE_FINE).await?,
            current_min: self.get(&Quantity::READBACK_CURRENT_MIN).await?,
            current_max: self.get(&Quantity::READBACK_CURRENT_MAX).await?,
        })
    }

    /// Derived power in watts.
    pub async fn deriv_power(&self) -> Result<Decimal> {
        self.get(&Quantity::DERIV_POWER).await
    }

    /// Derived cumulative energy in joules.
    pub async fn deriv_energy(&self) -> Result<Decimal> {
        self.get(&Quantity::DERIV_ENERGY).await
    }

    pub async fn set_current_range_count(&self, ranges: u8) -> Result<()> {
        self.set(&Quantity::CONFIG_CURRENT_RANGES, Decimal::from(ranges)).await
    }

    fn check_calibration(&self, quantity: &Quantity) -> Result<()> {
        if self.table.is_calibration(quantity) {
            Ok(())
        } else {
            Err(SmuError::validation(format!("invalid calibration parameter: {quantity}")))
        }
    }

    pub async fn cal_get(&self, quantity: &Quantity) -> Result<Decimal> {
        self.check_calibration(quantity)?;
        self.get(quantity).await
    }

    pub async fn cal_set(&self, quantity: &Quantity, value: Decimal) -> Result<()> {
        self.check_calibration(quantity)?;
        self.set(quantity, value).await
    }

    async fn cal_pair(&self, factor: &Quantity, offset: &Quantity) -> Result<(Decimal, Decimal)> {
        Ok((self.cal_get(factor).await?, self.cal_get(offset).await?))
    }

    async fn set_cal_pair(&self, factor: (&Quantity, Decimal), offset: (&Quantity, Decimal)) -> Result<()> {
        self.check_calibration(factor.0)?;
        self.check_calibration(offset.0)?;
        self.set(factor.0, factor.1).await?;
        self.set(offset.0, offset.1).await
    }

    /// Voltage measurement (factor, offset).
    pub async fn cal_voltage_meas(&self) -> Result<(Decimal, Decimal)> {
        self.cal_pair(&Quantity::CAL_VOLTAGE_MEAS_FACTOR, &Quantity::CAL_VOLTAGE_MEAS_OFFSET)
            .await
    }

    pub async fn set_cal_voltage_meas(&self, factor: Decimal, offset: Decimal) -> Result<()> {
        self.set_cal_pair(
            (&Quantity::CAL_VOLTAGE_MEAS_FACTOR, factor),
            (&Quantity::CAL_VOLTAGE_MEAS_OFFSET, offset),
        )
        .await
    }

    /// Voltage setpoint (factor, offset).
    pub async fn cal_voltage_set(&self) -> Result<(Decimal, Decimal)> {
        self.cal_pair(&Quantity::CAL_VOLTAGE_SET_FACTOR, &Quantity::CAL_VOLTAGE_SET_OFFSET)
            .await
    }

    pub async fn set_cal_voltage_set(&self, factor: Decimal, offset: Decimal) -> Result<()> {
        self.set_cal_pair(
            (&Quantity::CAL_VOLTAGE_SET_FACTOR, factor),
            (&Quantity::CAL_VOLTAGE_SET_OFFSET, offset),
        )
        .await
    }

    /// Current measurement (factor, offset) for one range.
    pub async fn cal_current_meas(&self, range: usize) -> Result<(Decimal, Decimal)> {
        self.cal_pair(
            &Quantity::cal_current_meas_factor(range),
            &Quantity::cal_current_meas_offset(range),
        )
        .await
    }

    pub async fn set_cal_current_meas(&self, range: usize, factor: Decimal, offset: Decimal) -> Result<()> {
        self.set_cal_pair(
            (&Quantity::cal_current_meas_factor(range), factor),
            (&Quantity::cal_current_meas_offset(range), offset),
        )
        .await
    }

    /// Current setpoint (factor, offset) for one range.
    pub async fn cal_current_set(&self, range: usize) -> Result<(Decimal, Decimal)> {
        self.cal_pair(
            &Quantity::cal_current_set_factor(range),
            &Quantity::cal_current_set_offset(range),
        )
        .await
    }

    pub async fn set_cal_current_set(&self, range: usize, factor: Decimal, offset: Decimal) -> Result<()> {
        self.set_cal_pair(
            (&Quantity::cal_current_set_factor(range), factor),
            (&Quantity::cal_current_set_offset(range), offset),
        )
        .await
    }

    /// Read every calibration parameter. Any failed read aborts the whole call.
    pub async fn calibration_all(&self) -> Result<CoefficientSet> {
        let mut set = CoefficientSet::new();
        for name in self.table.calibration_names() {
            let value = self.get(name).await?;
            set.insert(name.clone(), value);
        }
        Ok(set)
    }

    /// Write a set of calibration parameters.
    ///
    /// Every name is checked against the closed calibration set before the first
    /// write, so an invalid set writes nothing.
    pub async fn set_calibration_all(&self, set: &CoefficientSet) -> Result<()> {
        for name in set.keys() {
            self.check_calibration(name)?;
        }
        for (name, value) in set.iter() {
            self.set(name, *value).await?;
        }
        info!(count = set.len(), "Wrote calibration parameters");
        Ok(())
    }
}
