// Backup pipeline phases as reported by the transfer script

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current stage of the USB backup pipeline
///
/// The token set is owned by the transfer script; the monitor reflects it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Idle,
    Detecting,
    Mounting,
    Scanning,
    Checking,
    PendingName,
    PendingDecision,
    Transferring,
    Complete,
    AllDuplicates,
    Cancelled,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::Idle,
        Phase::Detecting,
        Phase::Mounting,
        Phase::Scanning,
        Phase::Checking,
        Phase::PendingName,
        Phase::PendingDecision,
        Phase::Transferring,
        Phase::Complete,
        Phase::AllDuplicates,
        Phase::Cancelled,
        Phase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Detecting => "DETECTING",
            Phase::Mounting => "MOUNTING",
            Phase::Scanning => "SCANNING",
            Phase::Checking => "CHECKING",
            Phase::PendingName => "PENDING_NAME",
            Phase::PendingDecision => "PENDING_DECISION",
            Phase::Transferring => "TRANSFERRING",
            Phase::Complete => "COMPLETE",
            Phase::AllDuplicates => "ALL_DUPLICATES",
            Phase::Cancelled => "CANCELLED",
            Phase::Failed => "FAILED",
        }
    }

    /// Parse the content of the phase file
    ///
    /// Blank content and unrecognised tokens yield `None`: the script rewrites the file
    /// in place, so either can be a torn read and says nothing about the current phase.
    pub fn parse(content: &str) -> Option<Phase> {
        let token = content.trim();
        if token.is_empty() {
            return None;
        }

        let phase = Phase::ALL.iter().copied().find(|phase| phase.as_str() == token);
        if phase.is_none() {
            log::debug!("Unrecognised phase token '{token}', ignoring");
        }
        phase
    }

    /// Phases that do not self-advance; leaving them needs device removal or eject
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Complete | Phase::AllDuplicates | Phase::Cancelled | Phase::Failed
        )
    }

    /// Phases during which the transfer pipeline is busy
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Detecting
                | Phase::Mounting
                | Phase::Scanning
                | Phase::Checking
                | Phase::PendingName
                | Phase::PendingDecision
                | Phase::Transferring
        )
    }

    /// Phases without a measurable completion percentage
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            Phase::Detecting | Phase::Mounting | Phase::Scanning | Phase::Checking
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_every_token() {
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
            assert_eq!(Phase::parse(&format!("{}\n", phase.as_str())), Some(phase));
        }
    }

    #[test]
    fn test_parse_blank_and_partial_is_no_reading() {
        assert_eq!(Phase::parse(""), None);
        assert_eq!(Phase::parse("  \n"), None);
        assert_eq!(Phase::parse("TRANSF"), None);
        assert_eq!(Phase::parse("PENDING_DEC"), None);
        assert_eq!(Phase::parse("complete"), None);
    }

    #[test]
    fn test_classification_is_disjoint() {
        for phase in Phase::ALL {
            assert!(!(phase.is_terminal() && phase.is_active()), "{phase}");
        }
        assert!(!Phase::Idle.is_terminal());
        assert!(!Phase::Idle.is_active());
        assert!(Phase::Checking.is_indeterminate());
        assert!(!Phase::Transferring.is_indeterminate());
    }

    #[test]
    fn test_serde_uses_tokens() {
        let json = serde_json::to_string(&Phase::PendingDecision).unwrap();
        assert_eq!(json, "\"PENDING_DECISION\"");
    }
}
