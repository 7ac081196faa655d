pub mod apps;
pub mod command;
pub mod config;
pub mod logcheck;
pub mod measurement;
pub mod report;
pub mod threshold;
pub mod types;
pub mod whitelist;

pub use apps::{AppDescriptor, AppRegistry, ProbeUrl, ReloadEdit};
pub use command::{Command, CommandBuilder, Template};
pub use config::HarnessConfig;
pub use logcheck::{Classification, LogAnalyzer, StartStop};
pub use measurement::{log_measurements, trimmed_mean, Measurement, MeasurementBuilder};
pub use report::{Outcome, ScenarioReport, StepRecord};
pub use threshold::{Observed, ThresholdSet};
pub use types::*;
pub use whitelist::WhitelistSet;
