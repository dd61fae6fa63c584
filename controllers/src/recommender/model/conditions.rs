use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use resources::objects::mpa::{ConditionStatus, ConditionType, MultidimPodAutoscalerCondition};

/// Conditions of an MPA keyed by type.
/// Iteration, and therefore the status list, is sorted by type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionsMap(BTreeMap<ConditionType, MultidimPodAutoscalerCondition>);

impl ConditionsMap {
    pub fn new() -> Self {
        ConditionsMap(BTreeMap::new())
    }

    pub fn from_list(conditions: &[MultidimPodAutoscalerCondition]) -> Self {
        ConditionsMap(
            conditions
                .iter()
                .map(|c| (c.type_, c.to_owned()))
                .collect(),
        )
    }

    /// Upsert a condition. The transition time is only bumped when the status changes.
    pub fn set(
        &mut self,
        type_: ConditionType,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: &str,
        now: NaiveDateTime,
    ) -> &mut Self {
        let status = status.into();
        let last_transition_time = match self.0.get(&type_) {
            Some(old) if old.status == status => old.last_transition_time,
            _ => Some(now),
        };
        self.0.insert(
            type_,
            MultidimPodAutoscalerCondition {
                type_,
                status,
                last_transition_time,
                reason: reason.to_string(),
                message: message.to_string(),
            },
        );
        self
    }

    pub fn delete(&mut self, type_: ConditionType) {
        self.0.remove(&type_);
    }

    pub fn get(&self, type_: ConditionType) -> Option<&MultidimPodAutoscalerCondition> {
        self.0.get(&type_)
    }

    /// Whether the condition is present with status True.
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_)
            .map_or(false, |c| c.status == ConditionStatus::True)
    }

    pub fn as_list(&self) -> Vec<MultidimPodAutoscalerCondition> {
        self.0.values().cloned().collect()
    }
}

/// Upsert a condition in a status condition list, keeping the list sorted by type.
pub fn set_condition(
    conditions: &mut Vec<MultidimPodAutoscalerCondition>,
    type_: ConditionType,
    status: impl Into<ConditionStatus>,
    reason: &str,
    message: &str,
    now: NaiveDateTime,
) {
    let mut map = ConditionsMap::from_list(conditions);
    map.set(type_, status, reason, message, now);
    *conditions = map.as_list();
}
