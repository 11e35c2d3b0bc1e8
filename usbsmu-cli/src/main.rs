mod operator;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use operator::ConsoleOperator;
use usbsmu_lib::calibration::{
    self, CalibrationOutcome, CurrentCalibration, CurrentCompCalibration, CurrentCompPlan, CurrentPlan,
    CurrentSetRatioCalibration, Procedure, RatioCurrentPlan, SelfCalVoltagePlan, VoltageCompCalibration,
    VoltageCompPlan, VoltageMeasCalibration, VoltageMeasPlan, VoltageSetFineCalibration, VoltageSetRatioCalibration,
    load_plan,
};
use usbsmu_lib::coefficients::device_file_name;
use usbsmu_lib::constants::{CALIBRATION_CSV, DEFAULT_DEVICE_PREFIX};
use usbsmu_lib::logger::RowAggregator;
use usbsmu_lib::{CoefficientSet, DeviceGeneration, HttpTransport, Smu};

/// How often the logger drains the device's sample log
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Calibration and data logging for the UsbSMU source-measure unit.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device address, host or host:port.
    #[arg(short, long, env = "USBSMU_ADDR")]
    addr: String,
    /// Firmware generation of the device: dual-switch, fine-dac or ratio-self-cal.
    #[arg(short, long, default_value_t = DeviceGeneration::RatioSelfCal)]
    generation: DeviceGeneration,
    /// Entity name prefix the firmware was built with.
    #[arg(long, default_value = DEFAULT_DEVICE_PREFIX)]
    prefix: String,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the device calibration, optionally dumping it to or restoring it from a file.
    Cal(CalArgs),
    /// Log samples to {name_prefix}_{mac}.csv until interrupted.
    Log(LogArgs),
    /// Calibrate voltage measurement against a reference voltmeter.
    AutocalVolts(ProcedureArgs),
    /// Calibrate one current range against a reference ammeter.
    AutocalAmps {
        /// Current range index, 0 is the highest range.
        #[arg(default_value_t = 0)]
        range: usize,
        #[command(flatten)]
        procedure: ProcedureArgs,
    },
    /// Self-calibrate the voltage setpoint using the fine DAC readbacks.
    SelfcalDac(ProcedureArgs),
    /// Self-calibrate the voltage setpoint using ratio readbacks.
    SelfcalVoltage(ProcedureArgs),
    /// Self-calibrate the source current setpoint using ratio readbacks.
    SelfcalCurrent(ProcedureArgs),
    /// Self-calibrate current source, sink and common-mode compensation.
    SelfcalComp(ProcedureArgs),
    /// Self-calibrate the voltage measurement cross-term with the output off.
    SelfcalCompVoltage(ProcedureArgs),
}

#[derive(Args, Debug)]
struct CalArgs {
    /// File name prefix; the file is {name_prefix}_{mac}.json.
    name_prefix: Option<String>,
    /// Write the device calibration to the file.
    #[arg(long, requires = "name_prefix", conflicts_with = "restore")]
    dump: bool,
    /// Write the calibration in the file to the device.
    #[arg(long, requires = "name_prefix")]
    restore: bool,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// File name prefix; the file is {name_prefix}_{mac}.csv.
    name_prefix: String,
    /// Don't store samples until the current reading is valid.
    #[arg(long)]
    delay_on: bool,
    /// Stop at the first invalid current reading.
    #[arg(long)]
    auto_stop: bool,
}

#[derive(Args, Debug)]
struct ProcedureArgs {
    /// JSON file overriding the built-in operating points.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// CSV file receiving one row per operating point.
    #[arg(long, default_value = CALIBRATION_CSV)]
    csv: PathBuf,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file =
            File::create(path).with_context(|| format!("Failed to create log file at: {}", path.display()))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // -v gives DEBUG, -vv TRACE; RUST_LOG overrides per target
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {}", path.display());
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{e:?}");
        drop(guard);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let smu = Smu::connect(&cli.addr, cli.generation, &cli.prefix)
        .with_context(|| format!("Failed to set up client for {}", cli.addr))?;

    match cli.command {
        Command::Cal(args) => cal_tool(&smu, args).await,
        Command::Log(args) => log_samples(&smu, args).await,
        Command::AutocalVolts(args) => {
            let procedure = VoltageMeasCalibration::new(plan(&args, VoltageMeasPlan::default())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::AutocalAmps { range, procedure: args } => {
            let procedure = CurrentCalibration::new(range, plan(&args, CurrentPlan::default())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::SelfcalDac(args) => {
            let procedure = VoltageSetFineCalibration::new(plan(&args, SelfCalVoltagePlan::fine_dac())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::SelfcalVoltage(args) => {
            let procedure = VoltageSetRatioCalibration::new(plan(&args, SelfCalVoltagePlan::fine_ratio())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::SelfcalCurrent(args) => {
            let procedure = CurrentSetRatioCalibration::new(plan(&args, RatioCurrentPlan::default())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::SelfcalComp(args) => {
            let procedure = CurrentCompCalibration::new(plan(&args, CurrentCompPlan::default())?);
            calibrate(&smu, procedure, &args.csv).await
        }
        Command::SelfcalCompVoltage(args) => {
            let procedure = VoltageCompCalibration::new(plan(&args, VoltageCompPlan::default())?);
            calibrate(&smu, procedure, &args.csv).await
        }
    }
}

/// The built-in plan, or `base` with the fields of `--plan` applied over it.
fn plan<P: Serialize + DeserializeOwned>(args: &ProcedureArgs, base: P) -> Result<P> {
    match &args.plan {
        Some(path) => load_plan(path, &base).with_context(|| format!("Failed to load plan {}", path.display())),
        None => Ok(base),
    }
}

async fn calibrate<P: Procedure>(smu: &Smu<HttpTransport>, procedure: P, csv_path: &Path) -> Result<()> {
    let mut sink = csv::Writer::from_path(csv_path)
        .with_context(|| format!("Failed to create CSV file at: {}", csv_path.display()))?;
    let mut operator = ConsoleOperator::new();
    info!(procedure = procedure.name(), csv = %csv_path.display(), "Starting calibration");

    let outcome = tokio::select! {
        outcome = calibration::run(&procedure, smu, &mut operator, &mut sink) => {
            outcome.with_context(|| format!("{} calibration failed", procedure.name()))?
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            warn!("Interrupted, disabling output");
            smu.enable(false, None).await.context("Failed to disable output")?;
            bail!("{} calibration interrupted", procedure.name());
        }
    };

    match outcome {
        CalibrationOutcome::Declined => info!("Calibration unchanged"),
        CalibrationOutcome::Discarded(_) => warn!("Device left with identity calibration, re-run or restore it"),
        CalibrationOutcome::Committed(set) => info!(count = set.len(), "Calibration committed"),
    }
    Ok(())
}

async fn cal_tool(smu: &Smu<HttpTransport>, args: CalArgs) -> Result<()> {
    let mac = smu.mac().await.context("Failed to read device MAC")?;
    info!(%mac, "Connected");

    let current = smu.calibration_all().await.context("Failed to read calibration")?;
    info!("Current calibration:\n{current}");

    let Some(prefix) = args.name_prefix.as_deref() else {
        return Ok(());
    };
    let path = PathBuf::from(device_file_name(prefix, &mac, "json"));

    if args.restore {
        let set = CoefficientSet::load(&path)
            .with_context(|| format!("Failed to read calibration file {}", path.display()))?;
        smu.set_calibration_all(&set)
            .await
            .context("Failed to write calibration")?;
        info!("Restored from {}", path.display());
    } else if args.dump {
        current
            .save(&path)
            .with_context(|| format!("Failed to write calibration file {}", path.display()))?;
        info!("Wrote to {}", path.display());
    }
    Ok(())
}

async fn log_samples(smu: &Smu<HttpTransport>, args: LogArgs) -> Result<()> {
    let mac = smu.mac().await.context("Failed to read device MAC")?;
    info!(%mac, "Connected");

    let path = device_file_name(&args.name_prefix, &mac, "csv");
    let mut writer = csv::Writer::from_path(&path).with_context(|| format!("Failed to create CSV file at: {path}"))?;
    writer.write_record(RowAggregator::header())?;
    writer.flush()?;

    let mut buffer = smu.sample_buffer();
    // Positions the cursor, older samples are not logged
    buffer.get().await.context("Failed to read sample log")?;

    let mut rows = RowAggregator::new(args.delay_on, args.auto_stop);
    let mut ticker = tokio::time::interval(LOG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(file = %path, "Logging, Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Interrupted");
                break;
            }
        }

        let samples = buffer.get().await.context("Failed to read sample log")?;
        for row in rows.push_all(&samples) {
            writer.write_record(&row)?;
        }
        writer.flush()?;

        if !samples.is_empty() {
            info!("Got {} samples", samples.len());
        }
        if rows.is_stopped() {
            info!("Done");
            break;
        }
    }

    if let Some(row) = rows.finish() {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    info!("Wrote {path}");
    Ok(())
}
