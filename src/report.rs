use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Summary of one completed save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub filename: String,
    pub path: PathBuf,
    pub pages: usize,
    pub attempts: u32,
    pub quality: f64,
    pub bytes: u64,
    pub started: String,
    pub finished: String,
}
