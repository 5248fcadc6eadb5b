//! Single owner of all coordinator state
//!
//! Timer ticks and operator commands are applied one at a time from the main loop;
//! [`Coordinator::view`] is the pure projection published to the dashboard.

use crate::decision::{DecisionGate, DecisionKind};
use crate::device::DeviceLifecycleCoordinator;
use crate::display_power::{Backlight, DisplayPowerManager};
use crate::os_ops::{OsOps, ProcessSignal};
use crate::status_channel::StatusChannel;
use crate::sync_control::{SyncController, SyncView};
use crate::transfer::{TransferStateMachine, TransferView};
use chrono::{DateTime, Local, NaiveDateTime};
use pebl_common::{OperationResult, PeblConfig, RemoteQuotaCache, SyncConfig, SyncStatusRecord};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Operator actions accepted from the control surface
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    Cancel,
    Eject,
    Remount,
    Dismount { confirmed: bool },
    SetSyncMode(SyncConfig),
    Decision { kind: DecisionKind, value: String },
    Activity,
    Dim,
}

/// A command plus the channel its result is returned on
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: OperatorCommand,
    pub reply: oneshot::Sender<OperationResult>,
}

/// Everything the dashboard renders
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub timestamp: DateTime<Local>,
    pub transfer: TransferView,
    pub sync: SyncView,
    pub display_dimmed: bool,
    pub last_operation: Option<OperationResult>,
}

pub struct Coordinator<O: OsOps> {
    ops: O,
    channel: StatusChannel,
    gate: DecisionGate,
    machine: TransferStateMachine,
    devices: DeviceLifecycleCoordinator,
    sync: SyncController,
    display: DisplayPowerManager,
    transfer_patterns: Vec<String>,
    eject_grace: Duration,
    sync_status: SyncStatusRecord,
    quota: Option<RemoteQuotaCache>,
    last_operation: Option<OperationResult>,
}

impl<O: OsOps> Coordinator<O> {
    pub fn new(config: &PeblConfig, ops: O, backlight: Box<dyn Backlight>, now: Instant) -> Self {
        let channel = StatusChannel::new(config);
        let quota = channel.read_quota();

        Self {
            ops,
            gate: DecisionGate::new(config),
            machine: TransferStateMachine::new(),
            devices: DeviceLifecycleCoordinator::new(config),
            sync: SyncController::new(config),
            display: DisplayPowerManager::new(backlight, config.timing.idle_dim(), now),
            transfer_patterns: config.transfer_process_patterns.clone(),
            eject_grace: config.timing.eject_grace(),
            sync_status: channel.read_sync_status(),
            quota,
            channel,
            last_operation: None,
        }
    }

    #[cfg(test)]
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Remove transfer state left over from a previous run
    pub fn startup(&mut self) {
        match self.channel.clear_transfer_state() {
            Ok(()) => log::info!("Cleared stale transfer state"),
            Err(e) => log::warn!("Failed to clear stale transfer state: {:#}", e),
        }
        self.machine.reset_to_idle();
    }

    /// Fast tick: project transfer and sync status
    pub fn on_status_tick(&mut self) {
        match self.channel.read_phase() {
            Some(phase) => {
                let progress = self.channel.read_progress();
                self.machine.observe(phase, progress, &mut self.gate);
            }
            None => log::debug!("No complete phase token, keeping {}", self.machine.phase()),
        }

        self.sync_status = self.channel.read_sync_status();
        self.quota = self.channel.read_quota();
    }

    /// Medium tick: leave a terminal phase once the source device is gone
    pub fn on_removal_tick(&mut self) {
        if !self.machine.phase().is_terminal() {
            return;
        }

        match self.devices.removable_connected(&self.ops) {
            Ok(true) => {}
            Ok(false) => {
                log::info!("USB source removed, resetting to idle");
                if let Err(e) = self.channel.clear_transfer_state() {
                    log::warn!("{:#}", e);
                }
                self.machine.reset_to_idle();
                self.gate.observe_phase(self.machine.phase());
            }
            Err(e) => log::debug!("Device enumeration failed, retrying: {:#}", e),
        }
    }

    /// Coarse tick: dim the display when idle
    pub fn on_idle_tick(&mut self, now: Instant) {
        self.display.check_idle(now);
    }

    pub fn handle(&mut self, command: OperatorCommand, now: Instant, local: NaiveDateTime) -> OperationResult {
        log::debug!("Operator command: {:?}", command);

        let result = match command {
            OperatorCommand::Cancel => self.cancel(),
            OperatorCommand::Eject => self.eject(now),
            OperatorCommand::Remount => {
                let report = self.devices.remount(&self.ops);
                let summary = report.summary();
                if report.is_success() {
                    OperationResult::success(summary)
                } else {
                    OperationResult::error(summary)
                }
            }
            OperatorCommand::Dismount { confirmed } => self.dismount(confirmed, now),
            OperatorCommand::SetSyncMode(schedule) => {
                self.sync.apply(schedule, local, &self.ops, &self.channel)
            }
            OperatorCommand::Decision { kind, value } => {
                match self.gate.record_decision(kind, &value) {
                    Ok(()) => {
                        self.machine.answer_prompt(kind);
                        OperationResult::success("Decision recorded")
                    }
                    Err(e) => OperationResult::error(format!("{e:#}")),
                }
            }
            OperatorCommand::Activity => {
                self.display.record_activity(now);
                return OperationResult::success("Display awake");
            }
            OperatorCommand::Dim => {
                self.display.dim_now();
                return OperationResult::success("Display dimmed");
            }
        };

        if result.success {
            log::info!("{}", result.message);
        } else {
            log::warn!("{}", result.message);
        }
        self.last_operation = Some(result.clone());
        result
    }

    fn cancel(&mut self) -> OperationResult {
        if !self.machine.phase().is_active() {
            return OperationResult::error("No transfer in progress");
        }

        let mut errors = Vec::new();
        for pattern in &self.transfer_patterns {
            if let Err(e) = self.ops.signal_processes(pattern, ProcessSignal::Kill) {
                errors.push(format!("{pattern}: {e:#}"));
            }
        }
        if let Err(e) = self.channel.force_cancelled() {
            errors.push(format!("{e:#}"));
        }

        self.machine.cancel();
        self.gate.observe_phase(self.machine.phase());

        if errors.is_empty() {
            OperationResult::success("Transfer cancelled")
        } else {
            OperationResult::error(format!("Transfer cancelled with errors: {}", errors.join(", ")))
        }
    }

    fn eject(&mut self, now: Instant) -> OperationResult {
        if self.machine.phase().is_active() {
            return OperationResult::error("Transfer in progress, cancel it before ejecting");
        }

        let report = self.devices.eject(&self.ops, &self.channel);
        self.machine.mark_ejected(now + self.eject_grace);
        self.gate.observe_phase(self.machine.phase());

        if report.is_success() {
            OperationResult::success("USB ejected, safe to remove")
        } else {
            OperationResult::error(format!("Eject incomplete: {}", report.errors.join(", ")))
        }
    }

    fn dismount(&mut self, confirmed: bool, now: Instant) -> OperationResult {
        if !confirmed {
            return OperationResult::error("Dismount requires confirmation");
        }

        let report = self.devices.dismount_all(&self.ops, &self.channel);
        self.machine.mark_ejected(now + self.eject_grace);
        self.gate.observe_phase(self.machine.phase());

        if report.is_success() {
            OperationResult::success("All devices unmounted - safe to power off")
        } else {
            OperationResult::error(format!("Dismount incomplete: {}", report.errors.join(", ")))
        }
    }

    pub fn view(&self, now: Instant, local: DateTime<Local>) -> DashboardView {
        let transfer_busy = self.channel.transfer_locked() || self.machine.phase().is_active();

        DashboardView {
            timestamp: local,
            transfer: self.machine.render(now),
            sync: self.sync.render(
                local.naive_local(),
                &self.sync_status,
                self.quota.as_ref(),
                transfer_busy,
            ),
            display_dimmed: self.display.is_dimmed(),
            last_operation: self.last_operation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os_ops::fake::FakeOps;
    use crate::status_channel::test_config;
    use crate::transfer::ProgressDisplay;
    use anyhow::Result;
    use chrono::NaiveDate;
    use pebl_common::{Phase, SyncMode};

    struct NoBacklight;

    impl Backlight for NoBacklight {
        fn set_brightness(&self, _level: u32) -> Result<()> {
            Ok(())
        }

        fn wake_level(&self) -> u32 {
            255
        }

        fn dim_level(&self) -> u32 {
            25
        }
    }

    fn afternoon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 2)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn setup() -> (tempfile::TempDir, PeblConfig, Coordinator<FakeOps>) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let coordinator =
            Coordinator::new(&config, FakeOps::default(), Box::new(NoBacklight), Instant::now());
        (dir, config, coordinator)
    }

    fn write_phase(config: &PeblConfig, phase: Phase) {
        std::fs::write(&config.status_file, phase.as_str()).unwrap();
    }

    fn phase_files_cleared(config: &PeblConfig) -> bool {
        config.transfer_state_files().iter().all(|path| !path.exists())
    }

    #[test]
    fn test_startup_clears_stale_state() {
        let (_dir, config, mut coordinator) = setup();
        write_phase(&config, Phase::Transferring);
        std::fs::write(&config.transfer_lock, "").unwrap();

        coordinator.startup();
        assert!(phase_files_cleared(&config));
        coordinator.on_status_tick();
        assert_eq!(coordinator.view(Instant::now(), Local::now()).transfer.phase, Phase::Idle);
    }

    #[test]
    fn test_complete_persists_until_removal() {
        let (_dir, config, mut coordinator) = setup();
        coordinator
            .ops()
            .state
            .borrow_mut()
            .devices
            .push(FakeOps::usb_disk("sdb", None, None));
        write_phase(&config, Phase::Complete);
        std::fs::write(&config.progress_file, r#"{"files_done": 12, "files_total": 12}"#).unwrap();

        for _ in 0..20 {
            coordinator.on_status_tick();
            coordinator.on_removal_tick();
            let view = coordinator.view(Instant::now(), Local::now());
            assert_eq!(view.transfer.phase, Phase::Complete);
            assert!(view.transfer.eject_enabled);
        }

        coordinator.ops().state.borrow_mut().devices.clear();
        coordinator.on_removal_tick();
        assert!(phase_files_cleared(&config));

        for _ in 0..5 {
            coordinator.on_status_tick();
            coordinator.on_removal_tick();
            assert_eq!(coordinator.view(Instant::now(), Local::now()).transfer.phase, Phase::Idle);
        }
    }

    #[test]
    fn test_enumeration_failure_keeps_terminal_phase() {
        let (_dir, config, mut coordinator) = setup();
        write_phase(&config, Phase::Failed);
        coordinator.ops().state.borrow_mut().fail_enumeration = true;

        coordinator.on_status_tick();
        coordinator.on_removal_tick();
        assert!(config.status_file.exists());
        assert_eq!(coordinator.view(Instant::now(), Local::now()).transfer.phase, Phase::Failed);
    }

    #[test]
    fn test_eject_from_complete_resets_once() {
        let (_dir, config, mut coordinator) = setup();
        coordinator
            .ops()
            .state
            .borrow_mut()
            .devices
            .push(FakeOps::usb_disk("sdb", None, None));
        write_phase(&config, Phase::Complete);
        coordinator.on_status_tick();

        let now = Instant::now();
        let result = coordinator.handle(OperatorCommand::Eject, now, afternoon());
        assert!(result.success, "{}", result.message);
        assert!(phase_files_cleared(&config));

        coordinator.on_status_tick();
        let view = coordinator.view(now, Local::now());
        assert_eq!(view.transfer.phase, Phase::Idle);
        assert_eq!(view.transfer.headline, "USB Ejected - Safe to Remove");
        assert!(!view.transfer.eject_enabled);

        let later = now + Duration::from_secs(3);
        assert_eq!(
            coordinator.view(later, Local::now()).transfer.headline,
            "Insert USB drive to start backup"
        );
    }

    #[test]
    fn test_eject_refused_while_active() {
        let (_dir, config, mut coordinator) = setup();
        write_phase(&config, Phase::Transferring);
        coordinator.on_status_tick();

        let result = coordinator.handle(OperatorCommand::Eject, Instant::now(), afternoon());
        assert!(!result.success);
        assert!(config.status_file.exists());
    }

    #[test]
    fn test_cancel_during_transfer() {
        let (_dir, config, mut coordinator) = setup();
        write_phase(&config, Phase::Transferring);
        std::fs::write(
            &config.progress_file,
            r#"{"percent": 55, "files_done": 11, "files_total": 20}"#,
        )
        .unwrap();
        std::fs::write(&config.transfer_lock, "").unwrap();
        {
            let mut state = coordinator.ops().state.borrow_mut();
            state.running.insert("on-usb-insert.sh".to_string());
            state.running.insert("rsync".to_string());
        }
        coordinator.on_status_tick();

        let result = coordinator.handle(OperatorCommand::Cancel, Instant::now(), afternoon());
        assert!(result.success, "{}", result.message);
        assert!(coordinator.ops().state.borrow().running.is_empty());
        assert!(coordinator.ops().calls().iter().all(|c| c.starts_with("pkill -KILL")));

        // reflected without another poll
        let view = coordinator.view(Instant::now(), Local::now());
        assert_eq!(view.transfer.phase, Phase::Cancelled);
        assert!(view.transfer.eject_enabled);
        assert_eq!(view.transfer.progress, ProgressDisplay::Fraction {
            fraction: 0.0,
            text: "Cancelled".to_string()
        });

        assert!(!config.transfer_lock.exists());
        coordinator.on_status_tick();
        let progress = StatusChannel::new(&config).read_progress();
        assert_eq!((progress.percent, progress.files_done, progress.files_total), (0, 0, 0));
        assert_eq!(coordinator.view(Instant::now(), Local::now()).transfer.phase, Phase::Cancelled);
    }

    #[test]
    fn test_cancel_when_idle_is_refused() {
        let (_dir, config, mut coordinator) = setup();
        let result = coordinator.handle(OperatorCommand::Cancel, Instant::now(), afternoon());
        assert!(!result.success);
        assert!(!config.status_file.exists());
        assert!(coordinator.ops().calls().is_empty());
    }

    #[test]
    fn test_decision_prompt_across_polls() {
        let (_dir, config, mut coordinator) = setup();
        write_phase(&config, Phase::PendingDecision);
        std::fs::write(&config.progress_file, r#"{"existing_files": 3, "files_total": 9}"#).unwrap();

        coordinator.on_status_tick();
        let prompt = coordinator
            .view(Instant::now(), Local::now())
            .transfer
            .prompt
            .unwrap();
        assert_eq!(prompt.kind, DecisionKind::Duplicate);
        assert_eq!(prompt.existing_files, 3);

        let result = coordinator.handle(
            OperatorCommand::Decision {
                kind: DecisionKind::Duplicate,
                value: "skip".to_string(),
            },
            Instant::now(),
            afternoon(),
        );
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(&config.decision_file).unwrap(), "skip");

        for _ in 0..10 {
            coordinator.on_status_tick();
            assert!(coordinator.view(Instant::now(), Local::now()).transfer.prompt.is_none());
        }
    }

    #[test]
    fn test_blank_phase_read_keeps_complete_while_usb_attached() {
        let (_dir, config, mut coordinator) = setup();
        coordinator
            .ops()
            .state
            .borrow_mut()
            .devices
            .push(FakeOps::usb_disk("sdb", None, None));
        write_phase(&config, Phase::Complete);
        std::fs::write(&config.transfer_lock, "").unwrap();
        coordinator.on_status_tick();

        for content in ["", "  \n", "COMPL", "IDLE"] {
            std::fs::write(&config.status_file, content).unwrap();
            coordinator.on_status_tick();
            coordinator.on_removal_tick();
            let view = coordinator.view(Instant::now(), Local::now());
            assert_eq!(view.transfer.phase, Phase::Complete, "after {content:?}");
            assert!(view.transfer.eject_enabled);
        }

        coordinator.ops().state.borrow_mut().devices.clear();
        coordinator.on_removal_tick();
        assert!(phase_files_cleared(&config));
        assert_eq!(coordinator.view(Instant::now(), Local::now()).transfer.phase, Phase::Idle);
    }

    #[test]
    fn test_torn_phase_reads_do_not_repeat_prompt() {
        let (_dir, config, mut coordinator) = setup();
        let mut sequences = Vec::new();

        for content in [
            "PENDING_DECISION",
            "PENDING_DECISION",
            "",
            "PENDING_DEC",
            "PENDING_DECISION",
        ] {
            std::fs::write(&config.status_file, content).unwrap();
            coordinator.on_status_tick();
            let view = coordinator.view(Instant::now(), Local::now());
            assert_eq!(view.transfer.phase, Phase::PendingDecision, "after {content:?}");
            if let Some(prompt) = view.transfer.prompt {
                if !sequences.contains(&prompt.sequence) {
                    sequences.push(prompt.sequence);
                }
            }
        }
        assert_eq!(sequences, vec![1]);
    }

    #[test]
    fn test_sync_mode_change_revokes_within_tick() {
        let (_dir, config, mut coordinator) = setup();
        std::fs::write(&config.sync_lock, "").unwrap();
        std::fs::write(&config.sync_status_file, r#"{"active": true, "percent": 10}"#).unwrap();
        coordinator
            .ops()
            .state
            .borrow_mut()
            .running
            .insert("backup-to-gdrive".to_string());
        coordinator.on_status_tick();

        let result = coordinator.handle(
            OperatorCommand::SetSyncMode(SyncConfig::custom(1, 5)),
            Instant::now(),
            afternoon(),
        );
        assert!(result.success, "{}", result.message);
        assert!(!config.sync_lock.exists());
        assert!(coordinator.ops().state.borrow().running.is_empty());

        let view = coordinator.view(Instant::now(), Local::now());
        assert_eq!(view.sync.mode, SyncMode::Custom);
        assert_eq!(view.last_operation, Some(result));
    }

    #[test]
    fn test_dismount_requires_confirmation() {
        let (_dir, config, mut coordinator) = setup();
        coordinator
            .ops()
            .state
            .borrow_mut()
            .mounted
            .insert(config.storage_mount.clone());

        let refused = coordinator.handle(
            OperatorCommand::Dismount { confirmed: false },
            Instant::now(),
            afternoon(),
        );
        assert!(!refused.success);
        assert!(coordinator.ops().calls().is_empty());

        let done = coordinator.handle(
            OperatorCommand::Dismount { confirmed: true },
            Instant::now(),
            afternoon(),
        );
        assert!(done.success, "{}", done.message);
        assert!(coordinator.ops().state.borrow().mounted.is_empty());
    }

    #[test]
    fn test_transfer_busy_holds_sync_panel() {
        let (_dir, config, mut coordinator) = setup();
        std::fs::write(&config.transfer_lock, "").unwrap();
        coordinator.on_status_tick();

        assert_eq!(
            coordinator.view(Instant::now(), Local::now()).sync.status,
            "Waiting for USB backup to complete..."
        );
    }

    #[test]
    fn test_operator_command_json() {
        let command: OperatorCommand = serde_json::from_str(
            r#"{"command": "decision", "kind": "device_name", "value": "CAM-B"}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            OperatorCommand::Decision {
                kind: DecisionKind::DeviceName,
                value: "CAM-B".to_string()
            }
        );

        let command: OperatorCommand =
            serde_json::from_str(r#"{"command": "dismount", "confirmed": true}"#).unwrap();
        assert_eq!(command, OperatorCommand::Dismount { confirmed: true });
    }
}
