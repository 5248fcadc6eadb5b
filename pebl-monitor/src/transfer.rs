// Transfer pipeline state and its render projection

use crate::decision::{DecisionGate, DecisionKind, PromptRequest};
use pebl_common::{Phase, ProgressRecord};
use serde::Serialize;
use std::time::Instant;

/// Progress bar contents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressDisplay {
    /// Indeterminate activity
    Pulse,
    Fraction { fraction: f64, text: String },
}

impl ProgressDisplay {
    fn fraction(fraction: f64, text: impl Into<String>) -> Self {
        ProgressDisplay::Fraction {
            fraction,
            text: text.into(),
        }
    }
}

/// Visual emphasis of the headline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Idle,
    Active,
    Pending,
    Complete,
    Failed,
}

/// Render-ready projection of the transfer pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferView {
    pub phase: Phase,
    pub tone: Tone,
    pub headline: String,
    pub message: String,
    pub file_info: String,
    pub file_types: String,
    pub current_file: String,
    pub speed: String,
    pub progress: ProgressDisplay,
    pub eject_enabled: bool,
    pub cancel_enabled: bool,
    pub prompt: Option<PromptRequest>,
}

impl TransferView {
    fn new(phase: Phase, tone: Tone, headline: &str, progress: ProgressDisplay) -> Self {
        Self {
            phase,
            tone,
            headline: headline.to_string(),
            message: String::new(),
            file_info: String::new(),
            file_types: String::new(),
            current_file: String::new(),
            speed: String::new(),
            progress,
            eject_enabled: phase.is_terminal(),
            cancel_enabled: phase.is_active(),
            prompt: None,
        }
    }
}

/// Projection of the externally reported phase
///
/// The machine mirrors whatever the transfer script reports, except that a terminal
/// phase holds against idle readings. It asserts state of its own on cancel and when
/// resetting to idle after removal or eject.
#[derive(Debug, Default)]
pub struct TransferStateMachine {
    phase: Phase,
    progress: ProgressRecord,
    prompt: Option<PromptRequest>,
    prompt_sequence: u64,
    ejected_until: Option<Instant>,
}

impl TransferStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn progress(&self) -> &ProgressRecord {
        &self.progress
    }

    #[cfg(test)]
    pub fn prompt(&self) -> Option<&PromptRequest> {
        self.prompt.as_ref()
    }

    /// Apply one poll of the status channel
    ///
    /// Returns a prompt when one is newly scheduled by this poll. An idle reading does
    /// not end a terminal phase; only removal, eject, or a new run does.
    pub fn observe(
        &mut self,
        phase: Phase,
        progress: ProgressRecord,
        gate: &mut DecisionGate,
    ) -> Option<PromptRequest> {
        if self.phase.is_terminal() && phase == Phase::Idle {
            return None;
        }
        gate.observe_phase(phase);

        if phase != self.phase {
            log::info!("Transfer phase {} -> {}", self.phase, phase);
            if self
                .prompt
                .as_ref()
                .is_some_and(|p| p.kind.trigger_phase() != phase)
            {
                self.prompt = None;
            }
        }
        if phase != Phase::Idle {
            self.ejected_until = None;
        }

        self.phase = phase;
        self.progress = progress;

        let kind = DecisionKind::for_phase(phase)?;
        if !gate.should_prompt(kind) {
            return None;
        }

        gate.mark_prompted(kind);
        self.prompt_sequence += 1;
        let prompt = PromptRequest {
            kind,
            sequence: self.prompt_sequence,
            files_total: self.progress.files_total,
            existing_files: self.progress.existing_files,
        };
        log::info!("Prompting operator for {:?} (#{})", kind, prompt.sequence);
        self.prompt = Some(prompt.clone());
        Some(prompt)
    }

    /// The operator answered; hide the prompt but keep the latch
    pub fn answer_prompt(&mut self, kind: DecisionKind) {
        if self.prompt.as_ref().is_some_and(|p| p.kind == kind) {
            self.prompt = None;
        }
    }

    /// Assert the cancelled state without waiting for the transfer script
    pub fn cancel(&mut self) {
        log::info!("Transfer phase {} -> {} (operator cancel)", self.phase, Phase::Cancelled);
        self.phase = Phase::Cancelled;
        self.progress = ProgressRecord::cancelled();
        self.prompt = None;
    }

    pub fn reset_to_idle(&mut self) {
        if self.phase != Phase::Idle {
            log::info!("Transfer phase {} -> {}", self.phase, Phase::Idle);
        }
        self.phase = Phase::Idle;
        self.progress = ProgressRecord::default();
        self.prompt = None;
        self.ejected_until = None;
    }

    /// Reset to idle, showing the ejected confirmation until `until`
    pub fn mark_ejected(&mut self, until: Instant) {
        self.reset_to_idle();
        self.ejected_until = Some(until);
    }

    pub fn ejected_banner(&self, now: Instant) -> bool {
        self.ejected_until.is_some_and(|until| now < until)
    }

    pub fn render(&self, now: Instant) -> TransferView {
        let mut view = render_phase(self.phase, &self.progress, self.ejected_banner(now));
        view.prompt = self.prompt.clone();
        view
    }
}

/// Map a phase and its progress record to what the operator sees
pub fn render_phase(phase: Phase, progress: &ProgressRecord, ejected: bool) -> TransferView {
    let pending_input = || ProgressDisplay::fraction(0.0, "Waiting for input...");

    match phase {
        Phase::Detecting | Phase::Mounting | Phase::Scanning | Phase::Checking => {
            let headline = match phase {
                Phase::Detecting => "USB Drive Detected",
                Phase::Mounting => "Mounting USB Drive...",
                Phase::Scanning => "Scanning Files...",
                _ => "Checking for Duplicates...",
            };
            let mut view = TransferView::new(phase, Tone::Active, headline, ProgressDisplay::Pulse);
            view.message = progress.message.clone();
            if phase == Phase::Checking && progress.existing_files > 0 {
                view.file_info = format!(
                    "Found {} duplicates out of {} files",
                    progress.existing_files, progress.files_total
                );
            } else if progress.files_total > 0 {
                view.file_info = format!("Found {} files", progress.files_total);
            }
            view
        }
        Phase::PendingName => {
            let mut view =
                TransferView::new(phase, Tone::Pending, "Enter Device Reference", pending_input());
            view.message = "Name this data source".to_string();
            view.file_info = format!("Found {} files", progress.files_total);
            view
        }
        Phase::PendingDecision => {
            let mut view =
                TransferView::new(phase, Tone::Pending, "Files Already Exist", pending_input());
            view.message = progress.message.clone();
            if progress.files_total > 0 {
                view.file_info = format!(
                    "{} of {} files already exist",
                    progress.existing_files, progress.files_total
                );
            }
            view
        }
        Phase::Transferring => {
            let percent = progress.percent.min(100);
            let mut view = TransferView::new(
                phase,
                Tone::Active,
                "Copying Files...",
                ProgressDisplay::fraction(f64::from(percent) / 100.0, format!("{percent}%")),
            );
            view.message = progress.message.clone();
            view.file_info = format!("Files: {} / {}", progress.files_done, progress.files_total);
            view.file_types = progress.file_types_summary(3);
            if !progress.current_file.is_empty() {
                view.current_file = format!(">> {}", progress.current_file);
            }
            if let Some(speed) = progress.speed_text() {
                view.speed = format!("Speed: {}  ETA: {}", speed, progress.eta);
            }
            view
        }
        Phase::Complete => {
            let files = if progress.files_done > 0 {
                progress.files_done
            } else {
                progress.files_total
            };
            let mut view = TransferView::new(
                phase,
                Tone::Complete,
                "Transfer Complete!",
                ProgressDisplay::fraction(1.0, "100%"),
            );
            view.message = format!("{files} files copied successfully");
            view.file_info = "Safe to remove USB drive".to_string();
            view
        }
        Phase::AllDuplicates => {
            let mut view = TransferView::new(
                phase,
                Tone::Complete,
                "All Files Already Backed Up",
                ProgressDisplay::fraction(1.0, "100%"),
            );
            view.message = format!("All {} files already exist on the HDD", progress.files_total);
            view.file_info = "No new files to transfer".to_string();
            view
        }
        Phase::Cancelled => {
            let mut view = TransferView::new(
                phase,
                Tone::Pending,
                "Transfer Cancelled",
                ProgressDisplay::fraction(0.0, "Cancelled"),
            );
            view.message = "Transfer was stopped by user".to_string();
            view.file_info = "You can now eject the USB drive".to_string();
            view
        }
        Phase::Failed => {
            let progress_bar = ProgressDisplay::fraction(0.0, "Error");
            if progress.files_done > 0 {
                let mut view =
                    TransferView::new(phase, Tone::Failed, "Completed with Warnings", progress_bar);
                view.message = format!("{} files copied", progress.files_done);
                view
            } else {
                let mut view = TransferView::new(phase, Tone::Failed, "Transfer Failed", progress_bar);
                view.message = if progress.message.is_empty() {
                    "Check logs for details".to_string()
                } else {
                    progress.message.clone()
                };
                view
            }
        }
        Phase::Idle if ejected => {
            let mut view = TransferView::new(
                phase,
                Tone::Complete,
                "USB Ejected - Safe to Remove",
                ProgressDisplay::fraction(0.0, "0%"),
            );
            view.message = "Remove the USB drive, then insert a new one to backup".to_string();
            view
        }
        Phase::Idle => {
            let mut view = TransferView::new(
                phase,
                Tone::Idle,
                "Insert USB drive to start backup",
                ProgressDisplay::fraction(0.0, "0%"),
            );
            view.message = "Waiting for USB...".to_string();
            view
        }
    }
}
