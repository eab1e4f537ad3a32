use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const BASE_ESTIMATE: Duration = Duration::from_millis(2000);
const CHART_ESTIMATE: Duration = Duration::from_millis(1500);
const INTERPRETATION_ESTIMATE: Duration = Duration::from_millis(1000);

/// Report payload handed over by the caller.
///
/// Only `intersection.name` and `datetime` are interpreted; everything else is
/// rendered by the caller-owned surface and carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub intersection: Intersection,
    pub datetime: String,
    #[serde(default)]
    pub traffic_volumes: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_volume: u64,
    #[serde(default)]
    pub average_speed: f64,
    #[serde(default)]
    pub interpretation: Option<String>,
    #[serde(default)]
    pub congestion_level: Option<String>,
    #[serde(default)]
    pub peak_direction: Option<String>,
    #[serde(default)]
    pub chart_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub ai_analysis: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intersection {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl ReportData {
    pub fn new(name: impl Into<String>, datetime: impl Into<String>) -> Self {
        Self {
            intersection: Intersection {
                id: None,
                name: name.into(),
                latitude: None,
                longitude: None,
            },
            datetime: datetime.into(),
            traffic_volumes: BTreeMap::new(),
            total_volume: 0,
            average_speed: 0.0,
            interpretation: None,
            congestion_level: None,
            peak_direction: None,
            chart_data: Vec::new(),
            ai_analysis: None,
        }
    }

    /// Advisory generation time for UI display. Never used as a timeout.
    pub fn estimate_generation_time(&self) -> Duration {
        let mut total = BASE_ESTIMATE;
        if !self.chart_data.is_empty() {
            total += CHART_ESTIMATE;
        }
        if self
            .interpretation
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
        {
            total += INTERPRETATION_ESTIMATE;
        }
        total
    }
}
