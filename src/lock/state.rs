//! Lock and Rule State Definitions
//!
//! Single-character codes match the `CHAR(1)` columns of the lock tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica lock / dataset lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Transfer to the location is still expected
    Replicating,
    /// Replica exists and is healthy
    Ok,
    /// Transfer failed, awaiting repair or manual intervention
    Stuck,
}

impl LockState {
    /// Get the storage code
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            LockState::Replicating => "R",
            LockState::Ok => "O",
            LockState::Stuck => "S",
        }
    }

    /// Convert from storage code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "R" => Some(LockState::Replicating),
            "O" => Some(LockState::Ok),
            "S" => Some(LockState::Stuck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Replicating => "REPLICATING",
            LockState::Ok => "OK",
            LockState::Stuck => "STUCK",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replication rule state
///
/// `Suspended` is terminal for the reconciler: only explicit intervention
/// moves a rule out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Replicating,
    Ok,
    Stuck,
    Suspended,
}

impl RuleState {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            RuleState::Replicating => "R",
            RuleState::Ok => "O",
            RuleState::Stuck => "S",
            RuleState::Suspended => "U",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "R" => Some(RuleState::Replicating),
            "O" => Some(RuleState::Ok),
            "S" => Some(RuleState::Stuck),
            "U" => Some(RuleState::Suspended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Replicating => "REPLICATING",
            RuleState::Ok => "OK",
            RuleState::Stuck => "STUCK",
            RuleState::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dataset-level tracking policy of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleGrouping {
    All,
    Dataset,
    /// No dataset locks are maintained for the rule
    None,
}

impl RuleGrouping {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            RuleGrouping::All => "A",
            RuleGrouping::Dataset => "D",
            RuleGrouping::None => "N",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(RuleGrouping::All),
            "D" => Some(RuleGrouping::Dataset),
            "N" => Some(RuleGrouping::None),
            _ => None,
        }
    }

    /// Whether dataset locks exist for rules with this grouping
    #[inline]
    pub fn tracks_datasets(&self) -> bool {
        !matches!(self, RuleGrouping::None)
    }
}

/// Data identifier type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DidType {
    File,
    Dataset,
    Container,
}

impl DidType {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            DidType::File => "F",
            DidType::Dataset => "D",
            DidType::Container => "C",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "F" => Some(DidType::File),
            "D" => Some(DidType::Dataset),
            "C" => Some(DidType::Container),
            _ => None,
        }
    }
}

impl fmt::Display for DidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DidType::File => "FILE",
            DidType::Dataset => "DATASET",
            DidType::Container => "CONTAINER",
        };
        write!(f, "{}", name)
    }
}

/// Notification policy of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleNotification {
    No,
    /// Notify on every lock that completes
    Progress,
    /// Notify once when the rule completes, including an end-user notice
    Yes,
}

impl RuleNotification {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            RuleNotification::No => "N",
            RuleNotification::Progress => "P",
            RuleNotification::Yes => "Y",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "N" => Some(RuleNotification::No),
            "P" => Some(RuleNotification::Progress),
            "Y" => Some(RuleNotification::Yes),
            _ => None,
        }
    }
}
