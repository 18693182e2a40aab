//! Signal message types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SignalParseError;
use crate::foreman_config::Mode;
use crate::roles::RoleKind;

/// What an external actor asks the control loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    /// Claim a specific Ready item now.
    Claim,
    Abort,
    Approve,
    /// Unblock: clear retry and fix counters and move Blocked back to Ready.
    Retry,
    /// Attempt the merge even in normal mode.
    Merge,
    SetMode,
    /// Demand-trigger the support role named in `flags[0]`.
    TriggerRole,
    Shutdown,
}

impl SignalAction {
    pub const ALL: [SignalAction; 8] = [
        Self::Claim,
        Self::Abort,
        Self::Approve,
        Self::Retry,
        Self::Merge,
        Self::SetMode,
        Self::TriggerRole,
        Self::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Abort => "abort",
            Self::Approve => "approve",
            Self::Retry => "retry",
            Self::Merge => "merge",
            Self::SetMode => "set_mode",
            Self::TriggerRole => "trigger_role",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn needs_item(&self) -> bool {
        matches!(
            self,
            Self::Claim | Self::Abort | Self::Approve | Self::Retry | Self::Merge
        )
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| format!("Invalid signal action: {}", s))
    }
}

/// One mailbox entry. `id` and `created_at` may be omitted by writers; the
/// mailbox fills them from the file name and modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(default)]
    pub id: String,
    pub action: SignalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl SignalMessage {
    pub fn new(action: SignalAction) -> Self {
        Self {
            id: String::new(),
            action,
            target_item: None,
            mode: None,
            flags: Vec::new(),
            created_at: None,
        }
    }

    pub fn for_item(action: SignalAction, item_id: impl Into<String>) -> Self {
        Self {
            target_item: Some(item_id.into()),
            ..Self::new(action)
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Check that the action has everything it needs.
    pub fn validate(&self) -> Result<(), SignalParseError> {
        let missing = match self.action {
            a if a.needs_item() => self.target_item.as_deref().is_none_or(str::is_empty),
            SignalAction::SetMode => self.mode.is_none(),
            SignalAction::TriggerRole => self
                .flags
                .first()
                .is_none_or(|f| f.parse::<RoleKind>().is_err()),
            _ => false,
        };
        if missing {
            return Err(SignalParseError::MissingTarget {
                action: self.action.to_string(),
            });
        }
        Ok(())
    }

    pub fn role(&self) -> Option<RoleKind> {
        self.flags.first().and_then(|f| f.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_parses() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"action": "abort", "target_item": "fm-3"}"#).unwrap();
        assert_eq!(msg.action, SignalAction::Abort);
        assert_eq!(msg.target_item.as_deref(), Some("fm-3"));
        assert!(msg.id.is_empty());
        assert!(msg.created_at.is_none());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_set_mode_parses_mode() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"action": "set_mode", "mode": "aggressive"}"#).unwrap();
        assert_eq!(msg.mode, Some(Mode::Aggressive));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_missing_target() {
        let err = SignalMessage::new(SignalAction::Approve).validate().unwrap_err();
        assert!(matches!(err, SignalParseError::MissingTarget { ref action } if action == "approve"));

        assert!(SignalMessage::new(SignalAction::SetMode).validate().is_err());
        assert!(SignalMessage::new(SignalAction::TriggerRole).validate().is_err());
        assert!(
            SignalMessage::new(SignalAction::TriggerRole)
                .with_flag("nonsense")
                .validate()
                .is_err()
        );
        assert!(
            SignalMessage::new(SignalAction::TriggerRole)
                .with_flag("auditor")
                .validate()
                .is_ok()
        );
        assert!(SignalMessage::new(SignalAction::Shutdown).validate().is_ok());
    }

    #[test]
    fn test_action_from_str_accepts_dashes() {
        assert_eq!("set-mode".parse::<SignalAction>().unwrap(), SignalAction::SetMode);
        assert_eq!("TRIGGER_ROLE".parse::<SignalAction>().unwrap(), SignalAction::TriggerRole);
        assert!("explode".parse::<SignalAction>().is_err());
    }

    #[test]
    fn test_unknown_action_is_a_json_error() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"action": "explode"}"#).is_err());
    }
}
