pub mod results;

pub use results::{ResultRecord, ResultsLedger};
