use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::Parser;
use itertools::Itertools;
use log::*;

use testrunner::{TestFailure, TestReport, TestReportTest, TestResult};

/// Runs every scenario in a directory and writes a combined report
#[derive(Parser)]
struct Args {
    scenario_dir: String,
    output_dir: String,

    #[arg(short('j'), default_value_t = num_cpus::get())]
    parallel: usize,
}

fn get_binary_path(binary_name: &str) -> Result<PathBuf> {
    // First try using Cargo environment variable
    if let Ok(path) = env::var(format!("CARGO_BIN_EXE_{}", binary_name)) {
        return Ok(PathBuf::from(path));
    }

    // Otherwise find it relative to the current executable
    let current_exe = env::current_exe().context("Failed to get current executable path")?;
    let bin_dir = current_exe
        .parent()
        .context("Failed to get binary directory")?;
    Ok(bin_dir.join(binary_name))
}

fn run_single(single_bin: &Path, scenario: &Path, output_dir: &str) -> Result<TestReportTest> {
    let stem = scenario
        .file_stem()
        .context("Scenario without file name")?
        .to_string_lossy()
        .to_string();
    let output = Command::new(single_bin)
        .env("RUST_LOG_STYLE", "never")
        .arg(scenario)
        .output()
        .context("Failed to execute runner")?;
    fs::write(format!("{}/{}.log", output_dir, stem), &output.stderr)?;

    match serde_json::from_slice::<TestReportTest>(&output.stdout) {
        Ok(report) => Ok(report),
        Err(_) => Ok(TestReportTest {
            name: stem,
            file: scenario.to_string_lossy().to_string(),
            interrupts: 0,
            executed: vec![],
            result: TestResult::Failed(TestFailure::ExitCode(output.status.code().unwrap_or(-1))),
        }),
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();

    // Collect tests
    let tests = fs::read_dir(&args.scenario_dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<Vec<_>, std::io::Error>>()?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .sorted()
        .collect_vec();

    let single_bin = get_binary_path("single")?;
    if !single_bin.exists() {
        bail!("Runner binary {} not found", single_bin.display());
    }
    fs::create_dir_all(&args.output_dir)?;

    let report = Arc::new(Mutex::new(TestReport::default()));

    info!(
        "Collected {} tests, running {} tests in parallel",
        tests.len(),
        args.parallel
    );
    let pool = rusty_pool::ThreadPool::new(args.parallel, args.parallel, Duration::from_secs(60));
    let start_time = Instant::now();

    for test in tests {
        let t_report = Arc::clone(&report);
        let t_single_bin = single_bin.clone();
        let t_output_dir = args.output_dir.clone();

        pool.execute(move || {
            info!("Running {}...", test.display());
            let result = match run_single(&t_single_bin, &test, &t_output_dir) {
                Ok(r) => r,
                Err(e) => {
                    error!("{}: {:#}", test.display(), e);
                    TestReportTest {
                        name: test.to_string_lossy().to_string(),
                        file: test.to_string_lossy().to_string(),
                        interrupts: 0,
                        executed: vec![],
                        result: TestResult::Failed(TestFailure::Setup(format!("{:#}", e))),
                    }
                }
            };
            let verdict: &'static str = (&result.result).into();
            info!("{}: {}", result.name, verdict);
            t_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tests
                .push(result);
        });
    }
    pool.shutdown_join();

    let mut report = report.lock().unwrap_or_else(PoisonError::into_inner);
    report.tests.sort_by(|a, b| a.file.cmp(&b.file));
    fs::write(
        format!("{}/report.json", args.output_dir),
        serde_json::to_string(&*report)?,
    )?;
    info!(
        "{}/{} tests passed in {:?}",
        report.passed(),
        report.tests.len(),
        Instant::now() - start_time
    );

    Ok(())
}
