use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::*;

use testrunner::scenario::Scenario;
use testrunner::{TestFailure, TestReportTest, TestResult};

/// Runs one scenario file and prints its report as JSON
#[derive(Parser)]
struct Args {
    scenario: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();
    let file = args.scenario.to_string_lossy().to_string();

    let report = match Scenario::load(&args.scenario) {
        Ok(scenario) => {
            info!("Running '{}'", scenario.name);
            let start = Instant::now();
            let outcome = scenario.run();
            info!("'{}' finished in {:?}", scenario.name, Instant::now() - start);

            match outcome {
                Ok(outcome) => {
                    for failure in &outcome.failures {
                        error!("{}", failure);
                    }
                    TestReportTest {
                        name: scenario.name,
                        file,
                        interrupts: outcome.interrupts,
                        executed: outcome.executed,
                        result: if outcome.failures.is_empty() {
                            TestResult::Pass
                        } else {
                            TestResult::Failed(TestFailure::Expectations(outcome.failures))
                        },
                    }
                }
                Err(e) => setup_failure(scenario.name, file, &e),
            }
        }
        Err(e) => setup_failure(file.clone(), file, &e),
    };

    println!("{}", serde_json::to_string(&report)?);
    if !matches!(report.result, TestResult::Pass) {
        std::process::exit(2);
    }
    Ok(())
}

fn setup_failure(name: String, file: String, e: &anyhow::Error) -> TestReportTest {
    error!("{:#}", e);
    TestReportTest {
        name,
        file,
        interrupts: 0,
        executed: vec![],
        result: TestResult::Failed(TestFailure::Setup(format!("{:#}", e))),
    }
}
