//! Input shapes for creating and editing schedules.
//!
//! `NewSchedule` and `NewStage` deserialize from the TOML plan files the
//! daemon's `apply` command reads:
//!
//! ```toml
//! name = "new-checkout"
//! feature_flag_id = "flag-checkout"
//! min_stage_duration = 2
//!
//! [[stages]]
//! name = "canary"
//! target_percentage = 10
//! trigger_type = "time_based"
//! trigger_configuration = { duration = 6 }
//! ```

use serde::{Deserialize, Serialize};
use stagehand_state::{TriggerConfiguration, TriggerType};

use crate::lifecycle::FULL_ROLLOUT;

fn full_rollout() -> u32 {
    FULL_ROLLOUT
}

fn manual() -> TriggerType {
    TriggerType::Manual
}

/// A schedule to create, with its initial stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub feature_flag_id: String,
    #[serde(default)]
    pub start_date: Option<u64>,
    #[serde(default)]
    pub end_date: Option<u64>,
    #[serde(default = "full_rollout")]
    pub max_percentage: u32,
    /// Minimum hours between consecutive stage activations.
    #[serde(default)]
    pub min_stage_duration: Option<u32>,
    #[serde(default)]
    pub stages: Vec<NewStage>,
}

/// A stage to create. Without `stage_order` the stage is placed by its
/// position in the plan, or appended when added to an existing schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStage {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub stage_order: Option<u32>,
    pub target_percentage: u32,
    #[serde(default = "manual")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_configuration: TriggerConfiguration,
    #[serde(default)]
    pub start_date: Option<u64>,
}

impl NewStage {
    pub fn new(name: impl Into<String>, target_percentage: u32, trigger_type: TriggerType) -> Self {
        Self {
            name: name.into(),
            description: None,
            stage_order: None,
            target_percentage,
            trigger_type,
            trigger_configuration: TriggerConfiguration::new(),
            start_date: None,
        }
    }

    /// Time-based stage that completes `hours` after activation.
    pub fn timed(name: impl Into<String>, target_percentage: u32, hours: u32) -> Self {
        let mut stage = Self::new(name, target_percentage, TriggerType::TimeBased);
        stage
            .trigger_configuration
            .insert(crate::trigger::DURATION_KEY.to_string(), hours.into());
        stage
    }
}

/// Partial update of a pending stage. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub stage_order: Option<u32>,
    pub target_percentage: Option<u32>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_configuration: Option<TriggerConfiguration>,
    /// `Some(None)` clears the start date.
    pub start_date: Option<Option<u64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_from_toml_with_defaults() {
        let plan: NewSchedule = toml::from_str(
            r#"
            name = "new-checkout"
            feature_flag_id = "flag-checkout"
            min_stage_duration = 2

            [[stages]]
            name = "canary"
            target_percentage = 10
            trigger_type = "time_based"
            trigger_configuration = { duration = 6 }

            [[stages]]
            name = "everyone"
            target_percentage = 100
            "#,
        )
        .unwrap();

        assert_eq!(plan.max_percentage, 100);
        assert_eq!(plan.min_stage_duration, Some(2));
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].trigger_type, TriggerType::TimeBased);
        assert_eq!(
            plan.stages[0].trigger_configuration.get("duration"),
            Some(&serde_json::json!(6))
        );
        assert_eq!(plan.stages[1].trigger_type, TriggerType::Manual);
        assert_eq!(plan.stages[1].stage_order, None);
    }

    #[test]
    fn plan_without_stages_parses_empty() {
        let plan: NewSchedule = toml::from_str(
            r#"
            name = "later"
            feature_flag_id = "f"
            "#,
        )
        .unwrap();
        assert!(plan.stages.is_empty());
    }

    #[test]
    fn unknown_trigger_is_rejected() {
        let result: Result<NewStage, _> = toml::from_str(
            r#"
            name = "x"
            target_percentage = 5
            trigger_type = "whenever"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn timed_stage_carries_duration() {
        let stage = NewStage::timed("canary", 5, 12);
        assert_eq!(stage.trigger_type, TriggerType::TimeBased);
        assert_eq!(
            stage.trigger_configuration.get("duration"),
            Some(&serde_json::json!(12))
        );
    }
}
