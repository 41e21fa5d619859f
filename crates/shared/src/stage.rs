use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The six fixed phases a project moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Discovery,
    DesignPlanning,
    Development,
    Testing,
    Deployment,
    TrainingMaintenance,
}

pub const STAGES: [Stage; 6] = [
    Stage::Discovery,
    Stage::DesignPlanning,
    Stage::Development,
    Stage::Testing,
    Stage::Deployment,
    Stage::TrainingMaintenance,
];

impl Stage {
    /// Share of the project fee billed for this stage. Sums to 100 over [`STAGES`].
    pub fn percentage(self) -> u8 {
        match self {
            Stage::Discovery => 15,
            Stage::DesignPlanning => 20,
            Stage::Development => 30,
            Stage::Testing => 15,
            Stage::Deployment => 15,
            Stage::TrainingMaintenance => 5,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::DesignPlanning => "design_planning",
            Stage::Development => "development",
            Stage::Testing => "testing",
            Stage::Deployment => "deployment",
            Stage::TrainingMaintenance => "training_maintenance",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Stage::Discovery => "Discovery",
            Stage::DesignPlanning => "Design & Planning",
            Stage::Development => "Development",
            Stage::Testing => "Testing",
            Stage::Deployment => "Deployment",
            Stage::TrainingMaintenance => "Training & Maintenance",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        STAGES.into_iter().find(|stage| stage.key() == key)
    }
}

/// Stage following `stage`. Clamps at the final stage instead of signalling
/// that the project is finished; use [`StageCompletion::all_complete`] for that.
pub fn next_stage(stage: Stage) -> Stage {
    let index = STAGES
        .iter()
        .position(|candidate| *candidate == stage)
        .unwrap_or(0);
    STAGES[(index + 1).min(STAGES.len() - 1)]
}

/// `round(total_fee * percentage / 100, 2)`.
pub fn invoice_amount(total_fee: f64, percentage: u8) -> f64 {
    let raw = total_fee * f64::from(percentage) / 100.0;
    (raw * 100.0).round() / 100.0
}

pub fn stage_invoice_amount(total_fee: f64, stage: Stage) -> f64 {
    invoice_amount(total_fee, stage.percentage())
}

/// Per-project record of finished stages. Missing stages read as unfinished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCompletion(BTreeMap<Stage, bool>);

impl StageCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.0.get(&stage).copied().unwrap_or(false)
    }

    pub fn mark(&mut self, stage: Stage) {
        self.0.insert(stage, true);
    }

    pub fn all_complete(&self) -> bool {
        STAGES.iter().all(|stage| self.is_complete(*stage))
    }

    pub fn completed_count(&self) -> usize {
        STAGES.iter().filter(|stage| self.is_complete(**stage)).count()
    }

    /// Billed percentage implied by the finished stages, for progress display.
    pub fn progress_percent(&self) -> u8 {
        STAGES
            .iter()
            .filter(|stage| self.is_complete(**stage))
            .map(|stage| stage.percentage())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_sum_to_one_hundred() {
        let total: u32 = STAGES.iter().map(|stage| u32::from(stage.percentage())).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn invoice_amount_matches_percentage_table() {
        let fee = 10_000.0;
        let expected = [1_500.0, 2_000.0, 3_000.0, 1_500.0, 1_500.0, 500.0];
        for (stage, amount) in STAGES.iter().zip(expected) {
            assert_eq!(stage_invoice_amount(fee, *stage), amount, "{stage:?}");
        }
    }

    #[test]
    fn invoice_amount_rounds_to_cents() {
        assert_eq!(invoice_amount(1_000.01, 15), 150.0);
        assert_eq!(invoice_amount(1_234.56, 5), 61.73);
        assert_eq!(invoice_amount(99.99, 30), 30.0);
    }

    #[test]
    fn discovery_on_ten_thousand_is_fifteen_hundred() {
        assert_eq!(Stage::Discovery.percentage(), 15);
        assert_eq!(stage_invoice_amount(10_000.0, Stage::Discovery), 1_500.0);
    }

    #[test]
    fn next_stage_is_monotonic_and_clamps() {
        for window in STAGES.windows(2) {
            assert_eq!(next_stage(window[0]), window[1]);
            assert!(next_stage(window[0]) > window[0]);
        }
        assert_eq!(
            next_stage(Stage::TrainingMaintenance),
            Stage::TrainingMaintenance
        );
    }

    #[test]
    fn stage_keys_round_trip_through_serde() {
        for stage in STAGES {
            let json = serde_json::to_string(&stage).expect("serialize");
            assert_eq!(json, format!("\"{}\"", stage.key()));
            assert_eq!(Stage::from_key(stage.key()), Some(stage));
        }
        assert_eq!(Stage::from_key("unknown"), None);
    }

    #[test]
    fn completion_map_tracks_finished_stages() {
        let mut completion = StageCompletion::new();
        assert!(!completion.is_complete(Stage::Discovery));
        completion.mark(Stage::Discovery);
        completion.mark(Stage::DesignPlanning);
        assert_eq!(completion.completed_count(), 2);
        assert_eq!(completion.progress_percent(), 35);
        assert!(!completion.all_complete());

        for stage in STAGES {
            completion.mark(stage);
        }
        assert!(completion.all_complete());
    }

    #[test]
    fn completion_map_reads_partial_json() {
        let completion: StageCompletion =
            serde_json::from_str(r#"{"discovery": true, "testing": false}"#).expect("json");
        assert!(completion.is_complete(Stage::Discovery));
        assert!(!completion.is_complete(Stage::Testing));
        assert!(!completion.is_complete(Stage::Deployment));
    }
}
