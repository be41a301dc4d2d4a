//! Impressions (what was shown) and actions (what the reader did).

use std::fmt;
use std::str::FromStr;

use leselern_core::Context;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// A recommendation shown to one identity under one arm.
///
/// `reward` and `attributed_at` are the only fields that change after
/// creation; a later attribution overwrites an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub id: String,
    pub identity: String,
    pub book_id: String,
    pub context: Context,
    pub arm_id: String,
    pub rank: u32,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub shown_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub attributed_at: Option<OffsetDateTime>,
}

/// Lifecycle of an impression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionStatus {
    Shown,
    Attributed,
    /// The lookback window has passed without attribution. Kept for audit.
    Expired,
}

impl Impression {
    pub fn status(&self, now: OffsetDateTime, lookback: Duration) -> ImpressionStatus {
        if self.reward.is_some() {
            ImpressionStatus::Attributed
        } else if now - self.shown_at > lookback {
            ImpressionStatus::Expired
        } else {
            ImpressionStatus::Shown
        }
    }
}

/// Reader interaction with a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Save,
    Unsave,
    /// Star rating; the rating itself is carried in [`Action::value`].
    Rate,
    EngagedView,
    Dismiss,
    Share,
}

impl ActionType {
    pub const ALL: [ActionType; 7] = [
        ActionType::Click,
        ActionType::Save,
        ActionType::Unsave,
        ActionType::Rate,
        ActionType::EngagedView,
        ActionType::Dismiss,
        ActionType::Share,
    ];

    /// Undecayed reward of this action type.
    ///
    /// `Rate` uses the supplied value; a missing or non-finite rating is worth 0.
    pub fn base_reward(self, value: Option<f64>) -> f64 {
        match self {
            ActionType::Click => 1.0,
            ActionType::Save => 3.0,
            ActionType::Unsave => -1.0,
            ActionType::Rate => value.filter(|v| v.is_finite()).unwrap_or(0.0),
            ActionType::EngagedView => 0.5,
            ActionType::Dismiss => -0.5,
            ActionType::Share => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::Save => "save",
            ActionType::Unsave => "unsave",
            ActionType::Rate => "rate",
            ActionType::EngagedView => "engaged_view",
            ActionType::Dismiss => "dismiss",
            ActionType::Share => "share",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownActionType(pub String);

impl fmt::Display for UnknownActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action type '{}'", self.0)
    }
}

impl std::error::Error for UnknownActionType {}

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == key)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}

/// Append-only record of a reader action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub identity: String,
    pub book_id: String,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Context the action happened in, if known. Used for the context match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
