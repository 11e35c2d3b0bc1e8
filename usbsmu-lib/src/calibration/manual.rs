//! Calibrations against an external reference meter read by the operator.

use super::plan::{CurrentPlan, PlanStep, VoltageMeasPlan};
use super::{Operator, Procedure, RecordSink, Solution, header, identity_of, record};
use crate::coefficients::CoefficientSet;
use crate::device::Smu;
use crate::error::{Result, SmuError};
use crate::quantity::{Quantity, QuantityTable};
use crate::regression::{linear_fit, to_decimal, to_f64};
use crate::transport::Transport;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::info;

/// Device reading paired with the reference meter's reading of the same point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPoint {
    pub observed: Decimal,
    pub reference: Decimal,
}

fn split(points: &[DataPoint]) -> (Vec<f64>, Vec<f64>) {
    points
        .iter()
        .map(|p| (to_f64(p.observed), to_f64(p.reference)))
        .unzip()
}

/// Fits the voltage measurement so the device reading matches the reference
/// voltmeter.
#[derive(Debug, Clone, Default)]
pub struct VoltageMeasCalibration {
    pub plan: VoltageMeasPlan,
}

impl VoltageMeasCalibration {
    pub fn new(plan: VoltageMeasPlan) -> Self {
        Self { plan }
    }
}

impl Procedure for VoltageMeasCalibration {
    type Data = Vec<DataPoint>;

    fn name(&self) -> &'static str {
        "Voltage measurement"
    }

    fn coefficients(&self, _table: &QuantityTable) -> Vec<Quantity> {
        vec![Quantity::CAL_VOLTAGE_MEAS_FACTOR, Quantity::CAL_VOLTAGE_MEAS_OFFSET]
    }

    fn identity(&self, _table: &QuantityTable) -> CoefficientSet {
        identity_of(&[Quantity::CAL_VOLTAGE_MEAS_FACTOR], &[Quantity::CAL_VOLTAGE_MEAS_OFFSET])
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        operator: &mut O,
        sink: &mut S,
    ) -> Result<Vec<DataPoint>> {
        sink.write_record(&header(&[
            "set_voltage",
            "set_current_min",
            "set_current_max",
            "meas_voltage",
            "meas_current",
            "ref_voltage",
        ]))?;

        let mut points = Vec::new();
        let mut enabled = false;
        for step in &self.plan.steps {
            let point = match step {
                PlanStep::Instruction(text) => {
                    operator.acknowledge(text).await?;
                    continue;
                }
                PlanStep::Point(point) => point,
            };
            smu.set_current_limits(point.current_min, point.current_max).await?;
            smu.set_voltage(point.voltage).await?;
            if !enabled {
                smu.enable(true, None).await?;
                enabled = true;
            }
            tokio::time::sleep(self.settle()).await;

            let (voltage, current) = smu.voltage_current().await?;
            let reference = operator
                .read_reference(&format!("{point}, MV={voltage}, MI={current}"))
                .await?;
            sink.write_record(&record([
                point.voltage,
                point.current_min,
                point.current_max,
                voltage,
                current,
                reference,
            ]))?;
            points.push(DataPoint {
                observed: voltage,
                reference,
            });
        }
        Ok(points)
    }

    fn solve(&self, _table: &QuantityTable, data: &Vec<DataPoint>) -> Result<Solution> {
        let (xs, ys) = split(data);
        let fit = linear_fit(&xs, &ys)?;
        let coefficients: CoefficientSet = [
            (Quantity::CAL_VOLTAGE_MEAS_FACTOR, to_decimal(fit.slope)?),
            (Quantity::CAL_VOLTAGE_MEAS_OFFSET, to_decimal(fit.intercept)?),
        ]
        .into_iter()
        .collect();
        Ok(Solution {
            coefficients,
            report: format!("Voltage meas calibration\n{}", fit.report(&ys)),
        })
    }
}

/// One measured point of a current calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentPoint {
    pub set_current_max: Decimal,
    pub meas_current: Decimal,
    pub reference: Decimal,
}

/// Fits current measurement, and on devices with per-range setpoint
/// calibration also the current setpoint, for one range against a reference
/// ammeter.
#[derive(Debug, Clone)]
pub struct CurrentCalibration {
    pub range: usize,
    pub plan: CurrentPlan,
}

impl CurrentCalibration {
    pub fn new(range: usize, plan: CurrentPlan) -> Self {
        Self { range, plan }
    }

    fn meas(&self) -> (Quantity, Quantity) {
        (
            Quantity::cal_current_meas_factor(self.range),
            Quantity::cal_current_meas_offset(self.range),
        )
    }

    /// Per-range setpoint coefficients, if this device generation has them.
    fn set(&self, table: &QuantityTable) -> Option<(Quantity, Quantity)> {
        let factor = Quantity::cal_current_set_factor(self.range);
        table
            .is_calibration(&factor)
            .then(|| (factor, Quantity::cal_current_set_offset(self.range)))
    }

    fn steps(&self) -> Result<&[PlanStep]> {
        self.plan
            .ranges
            .get(self.range)
            .map(|r| r.steps.as_slice())
            .ok_or_else(|| SmuError::validation(format!("no operating points for current range {}", self.range)))
    }
}

impl Procedure for CurrentCalibration {
    type Data = Vec<CurrentPoint>;

    fn name(&self) -> &'static str {
        "Current"
    }

    fn validate(&self, table: &QuantityTable) -> Result<()> {
        if self.range >= table.ranges().len() {
            return Err(SmuError::validation(format!(
                "invalid current range {}, device has {}",
                self.range,
                table.ranges().len()
            )));
        }
        self.steps().map(|_| ())
    }

    fn coefficients(&self, table: &QuantityTable) -> Vec<Quantity> {
        let (meas_factor, meas_offset) = self.meas();
        let mut names = vec![meas_factor, meas_offset];
        if let Some((set_factor, set_offset)) = self.set(table) {
            names.push(set_factor);
            names.push(set_offset);
        }
        names
    }

    fn identity(&self, table: &QuantityTable) -> CoefficientSet {
        let (meas_factor, meas_offset) = self.meas();
        let mut set = identity_of(&[meas_factor], &[meas_offset]);
        if let Some((set_factor, set_offset)) = self.set(table) {
            set.insert(set_factor, Decimal::ONE);
            set.insert(set_offset, Decimal::ZERO);
        }
        set
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.plan.settle_ms)
    }

    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        operator: &mut O,
        sink: &mut S,
    ) -> Result<Vec<CurrentPoint>> {
        let table = smu.table();
        let label = table.ranges().get(self.range).cloned().ok_or_else(|| {
            SmuError::validation(format!(
                "range {} does not exist, {} devices have {}",
                self.range,
                table.generation(),
                table.ranges().len()
            ))
        })?;
        let has_adc = table.supports(&Quantity::ADC_VOLTAGE);
        sink.write_record(&header(&[
            "set_voltage",
            "set_current_min",
            "set_current_max",
            "adc_voltage",
            "adc_current",
            "meas_voltage",
            "meas_current",
            "ref_current",
        ]))?;

        let mut points = Vec::new();
        let mut enabled = false;
        for step in self.steps()? {
            let point = match step {
                PlanStep::Instruction(text) => {
                    operator.acknowledge(text).await?;
                    continue;
                }
                PlanStep::Point(point) => point,
            };
            if !enabled {
                smu.set_current_limits(point.current_min, point.current_max).await?;
                smu.set_voltage(point.voltage).await?;
                smu.enable(true, Some(&label)).await?;
                enabled = true;
            }
            // Limits are scaled by the active range, so they are written again once it is selected
            smu.set_current_limits(point.current_min, point.current_max).await?;
            smu.set_voltage(point.voltage).await?;
            tokio::time::sleep(self.settle()).await;

            let (voltage, current) = smu.voltage_current().await?;
            let (adc_voltage, adc_current) = if has_adc {
                let (v, i) = smu.raw_voltage_current().await?;
                (v.to_string(), i.to_string())
            } else {
                (String::new(), String::new())
            };
            let reference = operator
                .read_reference(&format!("{point}, MV={voltage}, MI={current}"))
                .await?;

            let mut row = record([point.voltage, point.current_min, point.current_max]);
            row.extend([adc_voltage, adc_current]);
            row.extend(record([voltage, current, reference]));
            sink.write_record(&row)?;
            points.push(CurrentPoint {
                set_current_max: point.current_max,
                meas_current: current,
                reference,
            });
        }
        info!(range = %label, points = points.len(), "Collected current calibration points");
        Ok(points)
    }

    fn solve(&self, table: &QuantityTable, data: &Vec<CurrentPoint>) -> Result<Solution> {
        let refs: Vec<f64> = data.iter().map(|p| to_f64(p.reference)).collect();
        let meas: Vec<f64> = data.iter().map(|p| to_f64(p.meas_current)).collect();
        let meas_fit = linear_fit(&meas, &refs)?;

        let (meas_factor, meas_offset) = self.meas();
        let mut coefficients = CoefficientSet::new();
        coefficients.insert(meas_factor, to_decimal(meas_fit.slope)?);
        coefficients.insert(meas_offset, to_decimal(meas_fit.intercept)?);
        let mut report = format!("Current meas calibration\n{}", meas_fit.report(&refs));

        if let Some((set_factor, set_offset)) = self.set(table) {
            let setpoints: Vec<f64> = data.iter().map(|p| to_f64(p.set_current_max)).collect();
            let set_fit = linear_fit(&setpoints, &refs)?;
            coefficients.insert(set_factor, to_decimal(set_fit.slope)?);
            coefficients.insert(set_offset, to_decimal(set_fit.intercept)?);
            report.push_str(&format!("Current set calibration\n{}", set_fit.report(&refs)));
        }
        Ok(Solution { coefficients, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::DeviceGeneration;

    fn point(set: i64, meas: i64, reference: i64) -> CurrentPoint {
        CurrentPoint {
            set_current_max: Decimal::new(set, 2),
            meas_current: Decimal::new(meas, 3),
            reference: Decimal::new(reference, 3),
        }
    }

    #[test]
    fn test_current_solve_with_and_without_setpoint_terms() {
        let data = vec![point(10, 100, 102), point(50, 500, 510), point(100, 1000, 1020)];
        let procedure = CurrentCalibration::new(0, CurrentPlan::default());

        let dual = QuantityTable::for_generation(DeviceGeneration::DualSwitch);
        let solution = procedure.solve(&dual, &data).unwrap();
        assert_eq!(solution.coefficients.len(), 4);
        assert_eq!(
            solution.coefficients.get(&Quantity::cal_current_meas_factor(0)),
            Some(Decimal::new(102, 2))
        );

        let ratio = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        let solution = procedure.solve(&ratio, &data).unwrap();
        assert_eq!(solution.coefficients.len(), 2);
    }

    #[test]
    fn test_current_range_without_plan_is_rejected() {
        let ratio = QuantityTable::for_generation(DeviceGeneration::RatioSelfCal);
        let procedure = CurrentCalibration::new(2, CurrentPlan::default());
        assert!(matches!(procedure.validate(&ratio), Err(SmuError::Validation(_))));
        let procedure = CurrentCalibration::new(3, CurrentPlan::default());
        assert!(matches!(procedure.validate(&ratio), Err(SmuError::Validation(_))));
    }

    #[test]
    fn test_voltage_solve_needs_two_points() {
        let procedure = VoltageMeasCalibration::default();
        let table = QuantityTable::for_generation(DeviceGeneration::DualSwitch);
        let one = vec![DataPoint {
            observed: Decimal::ONE,
            reference: Decimal::ONE,
        }];
        assert!(matches!(procedure.solve(&table, &one), Err(SmuError::InsufficientData(_))));
    }
}
