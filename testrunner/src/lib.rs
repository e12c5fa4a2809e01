pub mod scenario;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, strum::IntoStaticStr)]
pub enum TestResult {
    Pass,
    Failed(TestFailure),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum TestFailure {
    /// Runner exited without a report
    ExitCode(i32),
    /// Scenario ran, expectations not met
    Expectations(Vec<String>),
    /// Scenario could not be loaded or set up
    Setup(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TestReportTest {
    pub name: String,
    pub file: String,
    /// Interrupts delivered to the host adapter
    pub interrupts: usize,
    /// CDBs received by the targets, in order
    pub executed: Vec<Vec<u8>>,
    pub result: TestResult,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TestReport {
    pub tests: Vec<TestReportTest>,
}

impl TestReport {
    pub fn passed(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| matches!(t.result, TestResult::Pass))
            .count()
    }
}
