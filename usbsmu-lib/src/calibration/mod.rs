//! Guided calibration procedures.
//!
//! Every procedure follows the same flow, driven by [`run`]:
//!
//! 1. read and show the coefficients the procedure owns,
//! 2. ask the operator whether to clear them (declining changes nothing),
//! 3. write identity values and wait for the device to settle,
//! 4. step through the operating points with the output guarded, so output is
//!    disabled on every exit path,
//! 5. fit new coefficients and show them with a per-point report,
//! 6. ask the operator whether to commit, and write them if so.

mod manual;
mod plan;
mod selfcal;

pub use manual::{CurrentCalibration, CurrentPoint, DataPoint, VoltageMeasCalibration};
pub use plan::{
    CurrentCompPlan, CurrentPlan, CurrentRangePlan, OperatingPoint, PlanStep, RatioCurrentPlan, SelfCalVoltagePlan,
    VoltageCompPlan, VoltageMeasPlan, load_plan,
};
pub use selfcal::{
    CurrentCompCalibration, CurrentSetRatioCalibration, VoltageCompCalibration, VoltageSetFineCalibration,
    VoltageSetRatioCalibration,
};

use crate::coefficients::CoefficientSet;
use crate::device::Smu;
use crate::error::{Result, SmuError};
use crate::quantity::{Quantity, QuantityTable};
use crate::regression::to_f64;
use crate::transport::Transport;
use rust_decimal::Decimal;
use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::{info, warn};

/// The human running a calibration.
///
/// Implementations decide how prompts are shown and answers collected; the
/// console implementation lives in the CLI, tests use scripted answers.
#[allow(async_fn_in_trait)]
pub trait Operator {
    /// Ask a yes/no question.
    async fn confirm(&mut self, prompt: &str) -> Result<bool>;

    /// Show an instruction (e.g. "Connect 4-ohm load") and wait until the operator is done.
    async fn acknowledge(&mut self, instruction: &str) -> Result<()>;

    /// Ask for a reading from the external reference meter.
    async fn read_reference(&mut self, prompt: &str) -> Result<Decimal>;
}

/// Destination for per-point records, written as they are taken.
pub trait RecordSink {
    fn write_record(&mut self, record: &[String]) -> Result<()>;
}

impl<W: io::Write> RecordSink for csv::Writer<W> {
    fn write_record(&mut self, record: &[String]) -> Result<()> {
        csv::Writer::write_record(self, record)?;
        self.flush()?;
        Ok(())
    }
}

impl RecordSink for Vec<Vec<String>> {
    fn write_record(&mut self, record: &[String]) -> Result<()> {
        self.push(record.to_vec());
        Ok(())
    }
}

/// How a calibration run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// The operator kept the stored coefficients; nothing was written.
    Declined,
    /// New coefficients were computed but the operator chose not to commit them.
    /// The device is left with identity values.
    Discarded(CoefficientSet),
    /// New coefficients were written to the device.
    Committed(CoefficientSet),
}

/// Fitted coefficients and a human-readable account of the fit.
#[derive(Debug, Clone)]
pub struct Solution {
    pub coefficients: CoefficientSet,
    pub report: String,
}

/// Predictor rows and targets collected by a self-calibration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesignData {
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl DesignData {
    pub fn push(&mut self, row: Vec<f64>, target: f64) {
        self.rows.push(row);
        self.targets.push(target);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One calibration procedure, run by [`run`].
#[allow(async_fn_in_trait)]
pub trait Procedure {
    type Data;

    fn name(&self) -> &'static str;

    /// Reject a run that cannot work on this device before anything is touched.
    fn validate(&self, _table: &QuantityTable) -> Result<()> {
        Ok(())
    }

    /// Coefficients this procedure determines, shown before clearing.
    fn coefficients(&self, table: &QuantityTable) -> Vec<Quantity>;

    /// Values written before collection so readings are uncorrected.
    fn identity(&self, table: &QuantityTable) -> CoefficientSet;

    fn settle(&self) -> Duration;

    /// Drive the device through the operating points. Output is disabled by the
    /// caller afterwards, whether this succeeds or not.
    async fn collect<T: Transport, O: Operator, S: RecordSink>(
        &self,
        smu: &Smu<T>,
        operator: &mut O,
        sink: &mut S,
    ) -> Result<Self::Data>;

    fn solve(&self, table: &QuantityTable, data: &Self::Data) -> Result<Solution>;
}

/// Run `body`, then disable the output no matter how `body` ended.
///
/// If both fail, the returned [`SmuError::OutputCleanup`] carries both errors.
pub async fn with_output_guard<T, R, F>(smu: &Smu<T>, body: F) -> Result<R>
where
    T: Transport,
    F: Future<Output = Result<R>>,
{
    let result = body.await;
    let cleanup = smu.enable(false, None).await;
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(original), Ok(())) => Err(original),
        (Err(original), Err(cleanup)) => {
            warn!(%cleanup, %original, "Output disable failed after procedure error");
            Err(SmuError::OutputCleanup {
                cleanup: Box::new(cleanup),
                original: Box::new(original),
            })
        }
    }
}

async fn read_coefficients<T: Transport>(smu: &Smu<T>, names: &[Quantity]) -> Result<CoefficientSet> {
    let mut set = CoefficientSet::new();
    for name in names {
        set.insert(name.clone(), smu.cal_get(name).await?);
    }
    Ok(set)
}

/// Run a procedure end to end with the operator in the loop.
pub async fn run<P, T, O, S>(procedure: &P, smu: &Smu<T>, operator: &mut O, sink: &mut S) -> Result<CalibrationOutcome>
where
    P: Procedure,
    T: Transport,
    O: Operator,
    S: RecordSink,
{
    let table = smu.table();
    procedure.validate(table)?;

    let stored = read_coefficients(smu, &procedure.coefficients(table)).await?;
    info!("{} stored calibration:\n{}", procedure.name(), stored);
    if !operator.confirm("Clear and re-run calibration?").await? {
        info!("Keeping stored calibration");
        return Ok(CalibrationOutcome::Declined);
    }

    smu.set_calibration_all(&procedure.identity(table)).await?;
    tokio::time::sleep(procedure.settle()).await;

    let data = with_output_guard(smu, procedure.collect(smu, operator, sink)).await?;
    let solution = procedure.solve(table, &data)?;
    info!("{} fit:\n{}", procedure.name(), solution.report);
    info!("New calibration:\n{}", solution.coefficients);

    if !operator.confirm("Commit to device?").await? {
        info!("New calibration discarded");
        return Ok(CalibrationOutcome::Discarded(solution.coefficients));
    }
    smu.set_calibration_all(&solution.coefficients).await?;
    info!("Wrote device calibration. Allow 5 seconds to commit to flash before power cycling.");
    Ok(CalibrationOutcome::Committed(solution.coefficients))
}

/// Identity values: gains to one, offsets and cross-terms to zero.
fn identity_of(ones: &[Quantity], zeros: &[Quantity]) -> CoefficientSet {
    ones.iter()
        .map(|q| (q.clone(), Decimal::ONE))
        .chain(zeros.iter().map(|q| (q.clone(), Decimal::ZERO)))
        .collect()
}

fn record<I: IntoIterator<Item = Decimal>>(values: I) -> Vec<String> {
    values.into_iter().map(|v| v.to_string()).collect()
}

fn header(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

fn f64s<const N: usize>(values: [Decimal; N]) -> Vec<f64> {
    values.into_iter().map(to_f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_of() {
        let set = identity_of(&[Quantity::CAL_VOLTAGE_SET_FACTOR], &[Quantity::CAL_VOLTAGE_SET_OFFSET]);
        assert_eq!(set.get(&Quantity::CAL_VOLTAGE_SET_FACTOR), Some(Decimal::ONE));
        assert_eq!(set.get(&Quantity::CAL_VOLTAGE_SET_OFFSET), Some(Decimal::ZERO));
    }

    #[test]
    fn test_vec_sink_collects_records() {
        let mut sink: Vec<Vec<String>> = Vec::new();
        RecordSink::write_record(&mut sink, &header(&["a", "b"])).unwrap();
        RecordSink::write_record(&mut sink, &record([Decimal::ONE, Decimal::TWO])).unwrap();
        assert_eq!(sink, vec![vec!["a", "b"], vec!["1", "2"]]);
    }

    #[test]
    fn test_csv_sink_writes_rows() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        RecordSink::write_record(&mut writer, &header(&["meas_voltage", "ref_voltage"])).unwrap();
        RecordSink::write_record(&mut writer, &record([Decimal::new(5002, 3), Decimal::new(5, 0)])).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text, "meas_voltage,ref_voltage\n5.002,5\n");
    }
}
