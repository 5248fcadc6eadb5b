//! Exactly-once operator prompts
//!
//! Each decision kind has a latch. The latch is set when a prompt is scheduled and
//! cleared only once the transfer phase has moved away from the phase that required
//! it. Answering a prompt does not clear it: the script may still report the pending
//! phase for a few polls after the answer is written.

use anyhow::{Context, Result};
use pebl_common::{PeblConfig, Phase};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Skip or overwrite files that already exist on primary storage
    Duplicate,
    /// Label for the inserted data source
    DeviceName,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 2] = [DecisionKind::Duplicate, DecisionKind::DeviceName];

    /// Phase in which the transfer script waits for this answer
    pub fn trigger_phase(&self) -> Phase {
        match self {
            DecisionKind::Duplicate => Phase::PendingDecision,
            DecisionKind::DeviceName => Phase::PendingName,
        }
    }

    pub fn for_phase(phase: Phase) -> Option<DecisionKind> {
        Self::ALL.into_iter().find(|kind| kind.trigger_phase() == phase)
    }

    fn index(&self) -> usize {
        match self {
            DecisionKind::Duplicate => 0,
            DecisionKind::DeviceName => 1,
        }
    }
}

/// A prompt scheduled for the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRequest {
    pub kind: DecisionKind,
    /// Increases with every scheduled prompt so clients can tell re-entries apart
    pub sequence: u64,
    pub files_total: u64,
    pub existing_files: u64,
}

#[derive(Debug)]
pub struct DecisionGate {
    latched: [bool; 2],
    duplicate_file: PathBuf,
    device_ref_file: PathBuf,
}

impl DecisionGate {
    pub fn new(config: &PeblConfig) -> Self {
        Self {
            latched: [false; 2],
            duplicate_file: config.decision_file.clone(),
            device_ref_file: config.device_ref_file.clone(),
        }
    }

    pub fn should_prompt(&self, kind: DecisionKind) -> bool {
        !self.latched[kind.index()]
    }

    pub fn mark_prompted(&mut self, kind: DecisionKind) {
        self.latched[kind.index()] = true;
    }

    pub fn clear_latch(&mut self, kind: DecisionKind) {
        self.latched[kind.index()] = false;
    }

    /// Release every latch whose triggering phase is no longer current
    pub fn observe_phase(&mut self, phase: Phase) {
        for kind in DecisionKind::ALL {
            if !self.should_prompt(kind) && kind.trigger_phase() != phase {
                log::debug!("Phase {} left, clearing {:?} latch", kind.trigger_phase(), kind);
                self.clear_latch(kind);
            }
        }
    }

    /// Write the operator's answer for the transfer script, replacing any earlier one
    pub fn record_decision(&self, kind: DecisionKind, value: &str) -> Result<()> {
        let path = match kind {
            DecisionKind::Duplicate => &self.duplicate_file,
            DecisionKind::DeviceName => &self.device_ref_file,
        };
        pebl_common::write_atomic(path, value.as_bytes())
            .with_context(|| format!("Failed to record {kind:?} decision"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_channel::test_config;

    #[test]
    fn test_kind_phase_mapping() {
        assert_eq!(DecisionKind::for_phase(Phase::PendingDecision), Some(DecisionKind::Duplicate));
        assert_eq!(DecisionKind::for_phase(Phase::PendingName), Some(DecisionKind::DeviceName));
        assert_eq!(DecisionKind::for_phase(Phase::Transferring), None);
    }

    #[test]
    fn test_latch_survives_until_phase_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = DecisionGate::new(&test_config(dir.path()));

        assert!(gate.should_prompt(DecisionKind::Duplicate));
        gate.mark_prompted(DecisionKind::Duplicate);

        gate.observe_phase(Phase::PendingDecision);
        assert!(!gate.should_prompt(DecisionKind::Duplicate));

        gate.record_decision(DecisionKind::Duplicate, "skip").unwrap();
        gate.observe_phase(Phase::PendingDecision);
        assert!(!gate.should_prompt(DecisionKind::Duplicate));

        gate.observe_phase(Phase::Transferring);
        assert!(gate.should_prompt(DecisionKind::Duplicate));
    }

    #[test]
    fn test_kinds_latch_independently() {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = DecisionGate::new(&test_config(dir.path()));

        gate.mark_prompted(DecisionKind::DeviceName);
        assert!(gate.should_prompt(DecisionKind::Duplicate));

        gate.observe_phase(Phase::PendingName);
        assert!(!gate.should_prompt(DecisionKind::DeviceName));

        gate.mark_prompted(DecisionKind::Duplicate);
        gate.observe_phase(Phase::PendingDecision);
        assert!(gate.should_prompt(DecisionKind::DeviceName));
        assert!(!gate.should_prompt(DecisionKind::Duplicate));
    }

    #[test]
    fn test_record_decision_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let gate = DecisionGate::new(&config);

        gate.record_decision(DecisionKind::Duplicate, "overwrite").unwrap();
        gate.record_decision(DecisionKind::Duplicate, "skip").unwrap();
        assert_eq!(std::fs::read_to_string(&config.decision_file).unwrap(), "skip");

        gate.record_decision(DecisionKind::DeviceName, "").unwrap();
        assert_eq!(std::fs::read_to_string(&config.device_ref_file).unwrap(), "");
    }
}
