use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};

use qs_scan::telemetry::{init_tracing, level_for};
use qs_scan::{JsonlResultStore, ScanDriver, ScanInput, ScanStopReason};
use qs_types::{NearAxisModel, QsError};

const USAGE: &str = "usage: qs-multiopt-scan <input.toml>";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [path] = args.as_slice() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            let config = err
                .chain()
                .any(|cause| cause.downcast_ref::<QsError>().is_some_and(QsError::is_config));
            ExitCode::from(if config { 2 } else { 1 })
        }
    }
}

fn run(path: &str) -> anyhow::Result<()> {
    let input = ScanInput::load(path).with_context(|| format!("loading {path}"))?;
    init_tracing(level_for(input.multiopt_scan.verbose));

    let results_path = input.multiopt_scan.results_path();
    let plan = input.into_plan(NearAxisModel)?;
    let store = JsonlResultStore::new(&results_path);

    let mut driver = ScanDriver::new(NearAxisModel, plan, store);
    info!("Run {} writing to {}", driver.run_id(), results_path.display());
    let report = driver.run()?;

    if report.stop_reason == ScanStopReason::WorkersLost {
        anyhow::bail!(
            "workers disconnected after {} of {} grid points",
            report.completed() + report.resumed,
            report.grid_points
        );
    }
    info!(
        "Done in {:.1}s: {} grid points, {} run, {} retained, {} persisted",
        report.elapsed.as_secs_f64(),
        report.grid_points,
        report.completed(),
        report.retained_count(),
        report.persisted
    );
    Ok(())
}
