use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use log::{info, warn};

use hplc_pump_ble::{
    init_logging, BlePumpConnector, ButtonCommand, Dispatcher, DriverConfig, ExperimentScheduler,
    MeasurementInterval, PumpRateCommand, RateUnit, RunStatus, StagePlan,
};

const PROGRESS_INTERVAL_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "pump-ctl", about = "Drive a BLE-retrofitted HPLC pump")]
struct Args {
    /// Bluetooth MAC address of the pump controller
    #[arg(long, env = "PUMP_MAC")]
    mac: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Press a front-panel button (RunStop, UP, DOWN, EDIT, MENU)
    Button { label: String },
    /// Set the flow rate
    Rate {
        value: f64,
        /// ul (µL/min) or ml (mL/min)
        #[arg(long, default_value = "ul")]
        unit: String,
    },
    /// Set the measurement notification interval in milliseconds
    Interval { ms: u16 },
    /// Reset the device clock
    Sync,
    /// Print measurement records until Ctrl+C
    Monitor {
        /// Stop after this many records
        #[arg(long)]
        count: Option<usize>,
    },
    /// Execute a JSON stage profile; Ctrl+C aborts
    Run {
        profile: PathBuf,
        /// Press RunStop if the run is aborted
        #[arg(long)]
        stop_on_abort: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = DriverConfig::from_env().context("invalid PUMP_* configuration")?;

    // Validate the command before touching the radio.
    let plan = match &args.command {
        Command::Run { profile, .. } => Some(
            StagePlan::from_json_file(profile)
                .with_context(|| format!("loading profile {}", profile.display()))?,
        ),
        _ => None,
    };

    let connector = BlePumpConnector::new(config.connector.clone());
    let transport = connector
        .find(&args.mac)
        .await
        .with_context(|| format!("looking for pump {}", args.mac))?;
    let dispatcher = Dispatcher::new(Arc::new(transport), config.dispatcher.clone());
    dispatcher.connect().await.context("connecting to pump")?;
    info!("connected to {}", args.mac);

    let outcome = execute(&dispatcher, &config, args.command, plan).await;

    if let Err(e) = dispatcher.disconnect().await {
        warn!("disconnect failed: {}", e);
    }
    outcome
}

async fn execute(
    dispatcher: &Arc<Dispatcher>,
    config: &DriverConfig,
    command: Command,
    plan: Option<StagePlan>,
) -> Result<()> {
    match command {
        Command::Button { label } => {
            let button: ButtonCommand = label.parse()?;
            dispatcher.send_button(button).await?;
            println!("pressed {button}");
        }
        Command::Rate { value, unit } => {
            let unit: RateUnit = unit.parse()?;
            let rate = PumpRateCommand::from_unit(value, unit)?;
            dispatcher.send_rate(rate).await?;
            println!("rate set to {} µL/min", rate.ul_min());
        }
        Command::Interval { ms } => {
            dispatcher.send_interval(MeasurementInterval::new(ms)?).await?;
            println!("measurement interval set to {ms} ms");
        }
        Command::Sync => {
            dispatcher.send_sync().await?;
            println!("device clock reset");
        }
        Command::Monitor { count } => monitor(dispatcher, count).await,
        Command::Run { stop_on_abort, .. } => {
            let plan = plan.context("no profile loaded")?;
            run_plan(dispatcher, config, plan, stop_on_abort).await?;
        }
    }
    Ok(())
}

async fn monitor(dispatcher: &Dispatcher, count: Option<usize>) {
    let records = dispatcher.notifications();
    let records = match count {
        Some(n) => records.take(n).boxed(),
        None => records.boxed(),
    };
    let printing = records.for_each(|r| async move {
        println!(
            "t={:>10} ms  psi={:>5}  current={:>5}  rate={:>5} µL/min",
            r.timestamp_ms, r.psi_raw, r.motor_current_raw, r.pump_rate_ul_min
        );
    });

    tokio::select! {
        _ = printing => {}
        _ = tokio::signal::ctrl_c() => info!("monitor interrupted"),
    }
}

async fn run_plan(
    dispatcher: &Arc<Dispatcher>,
    config: &DriverConfig,
    plan: StagePlan,
    stop_on_abort: bool,
) -> Result<()> {
    let scheduler = ExperimentScheduler::new(Arc::clone(dispatcher), config.scheduler.clone())?;
    println!(
        "running {} stages over {:?}",
        plan.stages().len(),
        plan.total_duration()
    );
    scheduler.start(plan)?;

    let mut progress = tokio::time::interval(Duration::from_secs(PROGRESS_INTERVAL_SECS));
    let result = loop {
        tokio::select! {
            result = scheduler.wait() => break result,
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted, aborting run");
                scheduler.abort()?;
            }
            _ = progress.tick() => {
                if let Some(s) = scheduler.snapshot() {
                    let pressure = dispatcher
                        .last_measurement()
                        .map(|m| m.psi_raw.to_string())
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{:?}/{:?} stage={:?} rate={:?} psi={}",
                        s.elapsed, s.total, s.stage_index, s.last_emitted_rate, pressure
                    );
                }
            }
        }
    };

    let aborted = !matches!(result, Ok(RunStatus::Completed));
    if aborted && stop_on_abort {
        match dispatcher.send_button(ButtonCommand::RunStop).await {
            Ok(()) => println!("pump stopped"),
            Err(e) => warn!("RunStop after abort failed: {}", e),
        }
    }

    let status = result.context("run failed")?;
    println!("run {status:?}");
    Ok(())
}
