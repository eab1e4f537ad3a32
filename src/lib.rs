pub mod assemble;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod filename;
pub mod generator;
pub mod memory;
pub mod model;
pub mod preview;
pub mod raster;
pub mod report;
pub mod retry;
pub mod status;
pub mod util;

pub use config::Config;
pub use error::{AttemptError, GenerateError};
pub use generator::{GenerationOutcome, ReportGenerator};
pub use model::ReportData;
pub use status::{GenerationStatus, Stage};
