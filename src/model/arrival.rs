use super::pick::Pick;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why an arrival does not take part in the location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exclusion {
    NotExcluded,
    LargeResidual,
    StationDistance,
    ManuallyExcluded,
    DeterioratesSolution,
    UnusedPhase,
    TemporarilyExcluded,
}

/// Binding of one pick to one origin hypothesis
#[derive(Debug, Clone, Serialize)]
pub struct Arrival {
    pub pick: Arc<Pick>,
    pub phase: String,
    pub residual: f64,
    pub distance: f64,
    pub azimuth: f64,
    pub affinity: f64,
    pub score: f64,
    /// Distance, amplitude and time sub-scores of the last scoring pass
    pub dscore: f64,
    pub ascore: f64,
    pub tscore: f64,
    pub excluded: Exclusion,
}

impl Arrival {
    pub fn new(pick: Arc<Pick>, phase: &str, residual: f64) -> Self {
        Self {
            pick,
            phase: phase.to_string(),
            residual,
            distance: 0.0,
            azimuth: 0.0,
            affinity: 0.0,
            score: 0.0,
            dscore: 0.0,
            ascore: 0.0,
            tscore: 0.0,
            excluded: Exclusion::NotExcluded,
        }
    }

    /// Counts towards the defining phase count
    pub fn is_defining(&self) -> bool {
        self.excluded == Exclusion::NotExcluded
    }

    pub fn pick_id(&self) -> &str {
        &self.pick.id
    }
}
