use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FLOWS: usize = 1000;

/// Settings for a single preview request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Report the calculated "before" action even when it disagrees with the recorded one.
    pub calculate_original_action: bool,
    pub augment_with_audit_data: bool,
    pub augment_with_current_configuration: bool,
    /// Target number of flows and capacity of the results channel.
    pub max_flows: usize,
    /// Drop flows whose outcome did not change.
    pub impacted_only: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            calculate_original_action: false,
            augment_with_audit_data: false,
            augment_with_current_configuration: false,
            max_flows: DEFAULT_MAX_FLOWS,
            impacted_only: false,
        }
    }
}
