//! Self-calibrations that use the device's own measurements as ground truth.
//!
//! No operator readings are needed beyond the clear/commit confirmations. The
//! ratio-readback variants work on full-scale ratios, where the setpoint ratios
//! run opposite to the measured ratios, so those fits are inverted afterwards.

use super::plan::{CurrentCompPlan, RatioCurrentPlan, SelfCalVoltagePlan, VoltageCompPlan};
use super::{DesignData, Operator, Procedure, RecordSink, Solution, f64s, header, identity_of, record};
use crate::coefficients::CoefficientSet;
use crate::constants::RATIO_MIDSCALE;
use crate::device::Smu;
use crate::error::{Result, SmuError};
use crate::quantity::{Quantity, QuantityTable};
use crate::regression::{AffineFit, affine_fit, to_decimal, to_f64};
use crate::transport::Transport;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, info};

fn require(table: &QuantityTable, quantities: &[Quantity]) -> Result<()> {
    match quantities.iter().find(|q| !table.supports(q)) {
        Some(missing) => Err(SmuError::validation(format!(
            "{} devices do not provide '{}'",
            table.generation(),
            missing
        ))),
        None => Ok(()),
    }
}

fn fit(data: &DesignData) -> Result<AffineFit> {
    if data.is_empty() {
        return Err(SmuError::InsufficientData("no points collected".to_string()));
    }
    let fit = affine_fit(&data.rows, &data.targets)?;
    info!(
        points = data.len(),
        rank = fit.rank,
        residuals = fit.residual_sum_squares,
        "Least-squares fit"
    );
    Ok(fit)
}

/// 1/x for a fitted gain, rejecting a zero gain.
fn inverse(value: f64) -> Result<Decimal> {
    to_decimal(1.0 / value)
}

fn solution<const N: usize>(values: [(Quantity, f64); N], fit: &AffineFit, data: &DesignData) -> Result<Solution> {
    let coefficients = values
        .into_iter()
        .map(|(q, v)| -> Result<(Quantity, Decimal)> { Ok((q, to_decimal(v)?)) })
        .collect::<Result<CoefficientSet>>()?;
    Ok(Solution {
        coefficients,
        report: fit.report(&data.targets),
    })
}

fn plan_settle(settle_ms: u64) -> Duration {
    Duration::from_millis(settle_ms)
}

/// Voltage setpoint calibration for devices with a separate fine DAC.
///
/// Solves `measured = factor * coarse + fine_factor * fine + offset` over the
/// setpoints as read back from the DACs.
#[derive(Debug, Clone)]
pub struct VoltageSetFineCalibration {
    pub plan: SelfCalVoltagePlan,
}

impl Default for VoltageSetFineCalibration {
    fn default() -> Self {
        Self::new(SelfCalVoltagePlan::fine_dac())
    }
}

impl VoltageSetFineCalibration {
    pub fn new(plan: SelfCalVoltagePlan) -> Self {
        Self { plan }
    }
}

impl Procedure for VoltageSetFineCalibration {
    type Data = DesignData;

    fn name(&self) -> &'static str {
        "Voltage set (fine DAC)"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        require(
            table,
            &[
                Quantity::SET_VOLTAGE_FINE,
                Quantity::READBACK_VOLTAGE,
                Quantity::READBACK_VOLTAGE_FINE,
            ],
        )
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        vec![
            Quantity::CAL_VOLTAGE_SET_FACTOR,
            Quantity::CAL_VOLTAGE_FINE_SET_FACTOR,
            Quantity::CAL_VOLTAGE_SET_OFFSET,
        ]
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(
            &[Quantity::CAL_VOLTAGE_SET_FACTOR, Quantity::CAL_VOLTAGE_FINE_SET_FACTOR],
            &[Quantity::CAL_VOLTAGE_SET_OFFSET],
        )
    }

    fn settle(&self) -> Duration {
        plan_settle(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        _operator: &mut O,
        sink: &mut S,
    ) -> Result<DesignData> {
        sink.write_record(&header(&["set_voltage", "set_voltage_fine", "meas_voltage"]))?;
        smu.set_current_limits(self.plan.current_min, self.plan.current_max).await?;
        smu.enable(true, Some(&self.plan.range)).await?;

        let mut data = DesignData::default();
        for &coarse in &self.plan.coarse {
            smu.set_voltage(coarse).await?;
            for &fine in &self.plan.fine {
                smu.set_voltage_fine(fine).await?;
                tokio::time::sleep(self.settle()).await;
                let readback = smu.setpoint_readback().await?;
                let (voltage, _) = smu.voltage_current().await?;
                debug!(set = %readback.voltage, fine = %readback.voltage_fine, meas = %voltage, "Point");
                sink.write_record(&record([readback.voltage, readback.voltage_fine, voltage]))?;
                data.push(f64s([readback.voltage, readback.voltage_fine]), to_f64(voltage));
            }
        }
        Ok(data)
    }

    fn solve(&self, _table: &QuantityTable, data: &DesignData) -> Result<Solution> {
        let fit = fit(data)?;
        solution(
            [
                (Quantity::CAL_VOLTAGE_SET_FACTOR, fit.coefficients[0]),
                (Quantity::CAL_VOLTAGE_FINE_SET_FACTOR, fit.coefficients[1]),
                (Quantity::CAL_VOLTAGE_SET_OFFSET, fit.offset),
            ],
            &fit,
            data,
        )
    }
}

/// Voltage setpoint calibration from full-scale ratio readbacks.
#[derive(Debug, Clone)]
pub struct VoltageSetRatioCalibration {
    pub plan: SelfCalVoltagePlan,
}

impl Default for VoltageSetRatioCalibration {
    fn default() -> Self {
        Self::new(SelfCalVoltagePlan::fine_ratio())
    }
}

impl VoltageSetRatioCalibration {
    pub fn new(plan: SelfCalVoltagePlan) -> Self {
        Self { plan }
    }
}

impl Procedure for VoltageSetRatioCalibration {
    type Data = DesignData;

    fn name(&self) -> &'static str {
        "Voltage set (ratio)"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        require(
            table,
            &[
                Quantity::SET_RATIO_VOLTAGE,
                Quantity::SET_RATIO_VOLTAGE_FINE,
                Quantity::MEAS_RATIO_VOLTAGE,
            ],
        )
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        vec![
            Quantity::CAL_VOLTAGE_SET_FACTOR,
            Quantity::CAL_VOLTAGE_FINE_SET_FACTOR,
            Quantity::CAL_VOLTAGE_SET_OFFSET,
        ]
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(
            &[Quantity::CAL_VOLTAGE_SET_FACTOR, Quantity::CAL_VOLTAGE_FINE_SET_FACTOR],
            &[Quantity::CAL_VOLTAGE_SET_OFFSET],
        )
    }

    fn settle(&self) -> Duration {
        plan_settle(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        _operator: &mut O,
        sink: &mut S,
    ) -> Result<DesignData> {
        sink.write_record(&header(&["set_ratio_voltage", "set_ratio_voltage_fine", "meas_ratio_voltage"]))?;
        smu.set_current_limits(self.plan.current_min, self.plan.current_max).await?;
        smu.enable(true, Some(&self.plan.range)).await?;

        let mut data = DesignData::default();
        for &coarse in &self.plan.coarse {
            smu.set_voltage(coarse).await?;
            for &fine in &self.plan.fine {
                smu.set(&Quantity::SET_RATIO_VOLTAGE_FINE, fine).await?;
                tokio::time::sleep(self.settle()).await;
                let set = smu.get(&Quantity::SET_RATIO_VOLTAGE).await?;
                let set_fine = smu.get(&Quantity::SET_RATIO_VOLTAGE_FINE).await?;
                let meas = smu.get(&Quantity::MEAS_RATIO_VOLTAGE).await?;
                debug!(%set, %set_fine, %meas, "Point");
                sink.write_record(&record([set, set_fine, meas]))?;
                data.push(f64s([set, set_fine]), -to_f64(meas));
            }
        }
        Ok(data)
    }

    fn solve(&self, _table: &QuantityTable, data: &DesignData) -> Result<Solution> {
        let fit = fit(data)?;
        let mut solution = solution(
            [(Quantity::CAL_VOLTAGE_SET_OFFSET, -fit.offset)],
            &fit,
            data,
        )?;
        solution
            .coefficients
            .insert(Quantity::CAL_VOLTAGE_SET_FACTOR, inverse(fit.coefficients[0])?);
        solution
            .coefficients
            .insert(Quantity::CAL_VOLTAGE_FINE_SET_FACTOR, inverse(fit.coefficients[1])?);
        Ok(solution)
    }
}

/// Source current setpoint calibration from full-scale ratio readbacks.
#[derive(Debug, Clone, Default)]
pub struct CurrentSetRatioCalibration {
    pub plan: RatioCurrentPlan,
}

impl CurrentSetRatioCalibration {
    pub fn new(plan: RatioCurrentPlan) -> Self {
        Self { plan }
    }
}

impl Procedure for CurrentSetRatioCalibration {
    type Data = DesignData;

    fn name(&self) -> &'static str {
        "Current set (ratio)"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        require(table, &[Quantity::SET_RATIO_CURRENT_MAX, Quantity::MEAS_RATIO_CURRENT])
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        vec![Quantity::CAL_CURRENT_SET_FACTOR, Quantity::CAL_CURRENT_SET_OFFSET]
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(&[Quantity::CAL_CURRENT_SET_FACTOR], &[Quantity::CAL_CURRENT_SET_OFFSET])
    }

    fn settle(&self) -> Duration {
        plan_settle(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        _operator: &mut O,
        sink: &mut S,
    ) -> Result<DesignData> {
        sink.write_record(&header(&["set_ratio_current_max", "meas_ratio_current"]))?;
        smu.set_voltage(self.plan.voltage).await?;
        smu.enable(true, Some(&self.plan.range)).await?;

        let mut data = DesignData::default();
        for &current_max in &self.plan.current_max {
            smu.set_current_limits(self.plan.current_min, current_max).await?;
            tokio::time::sleep(self.settle()).await;
            let set = smu.get(&Quantity::SET_RATIO_CURRENT_MAX).await?;
            let meas = smu.get(&Quantity::MEAS_RATIO_CURRENT).await?;
            debug!(%set, %meas, "Point");
            sink.write_record(&record([set, meas]))?;
            data.push(f64s([set]), -to_f64(meas));
        }
        Ok(data)
    }

    fn solve(&self, _table: &QuantityTable, data: &DesignData) -> Result<Solution> {
        let fit = fit(data)?;
        let mut solution = solution([(Quantity::CAL_CURRENT_SET_OFFSET, -fit.offset)], &fit, data)?;
        solution
            .coefficients
            .insert(Quantity::CAL_CURRENT_SET_FACTOR, inverse(fit.coefficients[0])?);
        Ok(solution)
    }
}

/// Source, sink and common-mode compensation of the current setpoint.
///
/// With the output shorted at the ADC midpoint, the measured current ratio
/// deviates from the setpoints by terms proportional to each limit's distance
/// from the measurement and to the output voltage. The fit solves
/// `-adc = sink * (adc - min) + source * (adc - max) + common * dv + offset`.
#[derive(Debug, Clone, Default)]
pub struct CurrentCompCalibration {
    pub plan: CurrentCompPlan,
}

impl CurrentCompCalibration {
    pub fn new(plan: CurrentCompPlan) -> Self {
        Self { plan }
    }

    const TERMS: [Quantity; 3] = [
        Quantity::CAL_CURRENT_SET_SINK_FACTOR,
        Quantity::CAL_CURRENT_SET_SOURCE_FACTOR,
        Quantity::CAL_CURRENT_COMMON_FACTOR,
    ];
}

impl Procedure for CurrentCompCalibration {
    type Data = DesignData;

    fn name(&self) -> &'static str {
        "Current compensation"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        require(
            table,
            &[
                Quantity::MEAS_RATIO_CURRENT,
                Quantity::MEAS_RATIO_VOLTAGE,
                Quantity::SET_RATIO_CURRENT_MIN,
                Quantity::SET_RATIO_CURRENT_MAX,
            ],
        )
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        Self::TERMS.to_vec()
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(&[], &Self::TERMS)
    }

    fn settle(&self) -> Duration {
        plan_settle(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        _operator: &mut O,
        sink: &mut S,
    ) -> Result<DesignData> {
        sink.write_record(&header(&[
            "set_voltage",
            "set_current_min",
            "set_current_max",
            "adc_ratio_current",
            "delta_current_min",
            "delta_current_max",
            "delta_voltage",
        ]))?;
        smu.enable(true, Some(&self.plan.range)).await?;

        let mut data = DesignData::default();
        for point in &self.plan.points {
            smu.set_voltage(point.voltage).await?;
            smu.set_current_limits(point.current_min, point.current_max).await?;
            tokio::time::sleep(self.settle()).await;

            let adc = smu.get(&Quantity::MEAS_RATIO_CURRENT).await? - RATIO_MIDSCALE;
            let delta_min = adc - smu.get(&Quantity::SET_RATIO_CURRENT_MIN).await?;
            let delta_max = adc - smu.get(&Quantity::SET_RATIO_CURRENT_MAX).await?;
            let delta_voltage = smu.get(&Quantity::MEAS_RATIO_VOLTAGE).await? - RATIO_MIDSCALE;
            debug!(%adc, %delta_min, %delta_max, %delta_voltage, "Point");
            sink.write_record(&record([
                point.voltage,
                point.current_min,
                point.current_max,
                adc,
                delta_min,
                delta_max,
                delta_voltage,
            ]))?;
            data.push(f64s([delta_min, delta_max, delta_voltage]), -to_f64(adc));
        }
        Ok(data)
    }

    fn solve(&self, _table: &QuantityTable, data: &DesignData) -> Result<Solution> {
        let fit = fit(data)?;
        let [sink, source, common] = Self::TERMS;
        let mut solution = solution(
            [
                (sink, fit.coefficients[0]),
                (source, fit.coefficients[1]),
                (common, fit.coefficients[2]),
            ],
            &fit,
            data,
        )?;
        solution.report.push_str(&format!("  + {} offset\n", fit.offset));
        Ok(solution)
    }
}

/// Cross-term between the voltage setpoint and the voltage measurement, taken
/// with the output disabled.
#[derive(Debug, Clone, Default)]
pub struct VoltageCompCalibration {
    pub plan: VoltageCompPlan,
}

impl VoltageCompCalibration {
    pub fn new(plan: VoltageCompPlan) -> Self {
        Self { plan }
    }
}

impl Procedure for VoltageCompCalibration {
    type Data = DesignData;

    fn name(&self) -> &'static str {
        "Voltage compensation"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        require(table, &[Quantity::MEAS_RATIO_VOLTAGE, Quantity::SET_RATIO_VOLTAGE])
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        vec![Quantity::CAL_VOLTAGE_MEAS_SET_FACTOR]
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(&[], &[Quantity::CAL_VOLTAGE_MEAS_SET_FACTOR])
    }

    fn settle(&self) -> Duration {
        plan_settle(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        _operator: &mut O,
        sink: &mut S,
    ) -> Result<DesignData> {
        sink.write_record(&header(&["set_voltage", "meas_ratio_voltage", "delta_voltage"]))?;
        smu.enable(false, None).await?;

        let mut data = DesignData::default();
        for &voltage in &self.plan.voltages {
            smu.set_voltage(voltage).await?;
            tokio::time::sleep(self.settle()).await;
            let adc = smu.get(&Quantity::MEAS_RATIO_VOLTAGE).await?;
            let delta = adc - smu.get(&Quantity::SET_RATIO_VOLTAGE).await?;
            debug!(%adc, %delta, "Point");
            sink.write_record(&record([voltage, adc, delta]))?;
            data.push(f64s([delta]), -to_f64(adc));
        }
        Ok(data)
    }

    fn solve(&self, _table: &QuantityTable, data: &DesignData) -> Result<Solution> {
        let fit = fit(data)?;
        let mut solution = solution([(Quantity::CAL_VOLTAGE_MEAS_SET_FACTOR, fit.coefficients[0])], &fit, data)?;
        solution.report.push_str(&format!("  + {} offset\n", fit.offset));
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::DeviceGeneration;

    #[test]
    fn test_ratio_voltage_fit_is_inverted() {
        // meas = -(set / 1.25 + fine / 50 - 0.01)
        let mut data = DesignData::default();
        for set in [0.1, 0.3, 0.5, 0.7] {
            for fine in [-0.4, 0.0, 0.4] {
                data.push(vec![set, fine], set / 1.25 + fine / 50.0 - 0.01);
            }
        }
        let table = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        let solution = VoltageSetRatioCalibration::default().solve(&table, &data).unwrap();
        let factor = solution.coefficients.get(&Quantity::CAL_VOLTAGE_SET_FACTOR).unwrap();
        let fine = solution.coefficients.get(&Quantity::CAL_VOLTAGE_FINE_SET_FACTOR).unwrap();
        let offset = solution.coefficients.get(&Quantity::CAL_VOLTAGE_SET_OFFSET).unwrap();
        assert_eq!(factor.round_dp(6), Decimal::new(125, 2));
        assert_eq!(fine.round_dp(6), Decimal::new(50, 0));
        assert_eq!(offset.round_dp(6), Decimal::new(1, 2));
    }

    #[test]
    fn test_empty_data_is_insufficient() {
        let table = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        let err = VoltageSetRatioCalibration::default()
            .solve(&table, &DesignData::default())
            .unwrap_err();
        assert!(matches!(err, SmuError::InsufficientData(ref m) if m == "no points collected"), "got {err:?}");
    }

    #[test]
    fn test_comp_column_order() {
        let mut data = DesignData::default();
        let rows = [
            [0.1, -0.2, 0.0],
            [0.3, 0.1, 0.0],
            [-0.2, 0.4, 0.1],
            [0.05, 0.05, 0.2],
            [0.2, -0.1, 0.3],
        ];
        for row in rows {
            data.push(row.to_vec(), 0.5 * row[0] + 0.25 * row[1] - 0.125 * row[2] + 0.001);
        }
        let table = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        let solution = CurrentCompCalibration::default().solve(&table, &data).unwrap();
        let get = |q: &Quantity| solution.coefficients.get(q).unwrap().round_dp(6);
        assert_eq!(get(&Quantity::CAL_CURRENT_SET_SINK_FACTOR), Decimal::new(5, 1));
        assert_eq!(get(&Quantity::CAL_CURRENT_SET_SOURCE_FACTOR), Decimal::new(25, 2));
        assert_eq!(get(&Quantity::CAL_CURRENT_COMMON_FACTOR), Decimal::new(-125, 3));
        assert_eq!(solution.coefficients.len(), 3);
    }

    #[test]
    fn test_fine_dac_not_on_ratio_devices() {
        let ratio = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        assert!(matches!(
            VoltageSetFineCalibration::default().validate(&ratio),
            Err(SmuError::Validation(_))
        ));
        let fine = QuantityTable::for_generation(DeviceGeneration::FineDac);
        assert!(VoltageSetFineCalibration::default().validate(&fine).is_ok());
        assert!(VoltageCompCalibration::default().validate(&fine).is_err());
    }
}
