//! HTTP dashboard and operator control surface
//!
//! Read endpoints serve the latest published [`DashboardView`]. Control endpoints
//! forward an [`OperatorCommand`] to the coordinator loop and wait for its result.

use crate::coordinator::{CommandEnvelope, DashboardView, OperatorCommand};
use crate::decision::DecisionKind;
use crate::notifications::{self, Notification, RECENT_LIMIT};
use crate::sync_control::SyncView;
use crate::transfer::{ProgressDisplay, Tone, TransferView};
use axum::extract::State;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Local};
use pebl_common::{OperationResult, Phase, SyncConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Clone)]
pub struct DashboardState {
    view: watch::Receiver<DashboardView>,
    commands: mpsc::Sender<CommandEnvelope>,
    notifications_file: Arc<PathBuf>,
}

impl DashboardState {
    pub fn new(
        view: watch::Receiver<DashboardView>,
        commands: mpsc::Sender<CommandEnvelope>,
        notifications_file: PathBuf,
    ) -> Self {
        Self {
            view,
            commands,
            notifications_file: Arc::new(notifications_file),
        }
    }

    fn snapshot(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    fn notifications(&self) -> Vec<Notification> {
        notifications::read_recent(&self.notifications_file, RECENT_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: Phase,
    pub timestamp: DateTime<Local>,
    pub notifications: Vec<Notification>,
    pub transfer: TransferView,
    pub sync: SyncView,
    pub display_dimmed: bool,
    pub last_operation: Option<OperationResult>,
}

#[derive(Debug, Deserialize)]
pub struct DismountRequest {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub kind: DecisionKind,
    #[serde(default)]
    pub value: String,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/cancel", post(cancel))
        .route("/api/eject", post(eject))
        .route("/api/remount", post(remount))
        .route("/api/dismount", post(dismount))
        .route("/api/sync-mode", post(sync_mode))
        .route("/api/decision", post(decision))
        .route("/api/activity", post(activity))
        .route("/api/dim", post(dim))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: DashboardState) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Dashboard serving on http://{}", addr);
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index(State(state): State<DashboardState>) -> Html<String> {
    Html(render_page(&state.snapshot(), &state.notifications()))
}

async fn api_status(
    State(state): State<DashboardState>,
) -> ([(HeaderName, &'static str); 1], Json<StatusResponse>) {
    let view = state.snapshot();
    let response = StatusResponse {
        status: view.transfer.phase,
        timestamp: view.timestamp,
        notifications: state.notifications(),
        transfer: view.transfer,
        sync: view.sync,
        display_dimmed: view.display_dimmed,
        last_operation: view.last_operation,
    };
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(response))
}

type CommandResponse = (StatusCode, Json<OperationResult>);

async fn cancel(State(state): State<DashboardState>) -> CommandResponse {
    dispatch(&state, OperatorCommand::Cancel).await
}

async fn eject(State(state): State<DashboardState>) -> CommandResponse {
    dispatch(&state, OperatorCommand::Eject).await
}

async fn remount(State(state): State<DashboardState>) -> CommandResponse {
    dispatch(&state, OperatorCommand::Remount).await
}

async fn dismount(
    State(state): State<DashboardState>,
    Json(request): Json<DismountRequest>,
) -> CommandResponse {
    dispatch(
        &state,
        OperatorCommand::Dismount {
            confirmed: request.confirm,
        },
    )
    .await
}

async fn sync_mode(
    State(state): State<DashboardState>,
    Json(schedule): Json<SyncConfig>,
) -> CommandResponse {
    dispatch(&state, OperatorCommand::SetSyncMode(schedule)).await
}

async fn decision(
    State(state): State<DashboardState>,
    Json(request): Json<DecisionRequest>,
) -> CommandResponse {
    dispatch(
        &state,
        OperatorCommand::Decision {
            kind: request.kind,
            value: request.value,
        },
    )
    .await
}

async fn activity(State(state): State<DashboardState>) -> CommandResponse {
    dispatch(&state, OperatorCommand::Activity).await
}

async fn dim(State(state): State<DashboardState>) -> CommandResponse {
    dispatch(&state, OperatorCommand::Dim).await
}

async fn dispatch(state: &DashboardState, command: OperatorCommand) -> CommandResponse {
    let unavailable = || {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(OperationResult::error("Monitor is shutting down")),
        )
    };

    let (reply, result) = oneshot::channel();
    if state
        .commands
        .send(CommandEnvelope { command, reply })
        .await
        .is_err()
    {
        return unavailable();
    }

    match result.await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(_) => unavailable(),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn status_class(tone: Tone) -> &'static str {
    match tone {
        Tone::Idle => "idle",
        Tone::Active | Tone::Pending => "transferring",
        Tone::Complete => "complete",
        Tone::Failed => "failed",
    }
}

fn progress_text(progress: &ProgressDisplay) -> &str {
    match progress {
        ProgressDisplay::Pulse => "Working...",
        ProgressDisplay::Fraction { text, .. } => text,
    }
}

const PAGE_STYLE: &str = r#"
        * { box-sizing: border-box; margin: 0; padding: 0; }
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
               background: #1a1a2e; color: #eee; min-height: 100vh; padding: 20px; }
        .container { max-width: 800px; margin: 0 auto; }
        h1 { text-align: center; margin-bottom: 30px; color: #00d4ff; }
        .card { background: #16213e; border-radius: 15px; padding: 30px; margin-bottom: 20px; text-align: center; }
        .status { font-size: 2em; font-weight: bold; padding: 20px; border-radius: 10px; margin: 20px 0; }
        .status.idle { background: #2d3436; color: #b2bec3; }
        .status.transferring { background: #0984e3; color: white; animation: pulse 1.5s infinite; }
        .status.complete { background: #00b894; color: white; }
        .status.failed { background: #d63031; color: white; }
        @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.7; } }
        .detail { color: #b2bec3; margin: 6px 0; }
        .notification { padding: 15px; border-bottom: 1px solid #2d3436; display: flex; justify-content: space-between; }
        .notification:last-child { border-bottom: none; }
        .notification .time { color: #636e72; font-size: 0.9em; }
        .notification .title { color: #00d4ff; font-weight: bold; }
        .refresh-info { text-align: center; color: #636e72; margin-top: 20px; font-size: 0.9em; }
"#;

/// Auto-refreshing status page; notifications are listed newest first
pub fn render_page(view: &DashboardView, notifications: &[Notification]) -> String {
    let transfer = &view.transfer;
    let sync = &view.sync;

    let mut details = String::new();
    for line in [
        &transfer.headline,
        &transfer.message,
        &transfer.file_info,
        &transfer.current_file,
        &transfer.speed,
    ] {
        if !line.is_empty() {
            let _ = write!(details, r#"<p class="detail">{}</p>"#, escape_html(line));
        }
    }
    let _ = write!(
        details,
        r#"<p class="detail">Progress: {}</p>"#,
        escape_html(progress_text(&transfer.progress))
    );

    let mut sync_details = String::new();
    for line in [&sync.mode_label, &sync.schedule, &sync.status, &sync.destination, &sync.storage] {
        if !line.is_empty() {
            let _ = write!(sync_details, r#"<p class="detail">{}</p>"#, escape_html(line));
        }
    }

    let mut activity = String::new();
    for n in notifications.iter().rev() {
        let _ = write!(
            activity,
            r#"<div class="notification"><div><span class="title">{}</span><span> - {}</span></div><span class="time">{}</span></div>"#,
            escape_html(&n.title),
            escape_html(&n.message),
            escape_html(n.short_time())
        );
    }
    if activity.is_empty() {
        activity.push_str(r#"<div class="notification">No recent activity</div>"#);
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>USB Transfer Status</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta http-equiv="refresh" content="5">
    <style>{style}</style>
</head>
<body>
    <div class="container">
        <h1>USB Transfer Monitor</h1>
        <div class="card">
            <h2>Current Status</h2>
            <div class="status {class}">{status}</div>
            {details}
            <p>Last updated: {timestamp}</p>
        </div>
        <div class="card">
            <h2>Cloud Sync</h2>
            {sync_details}
        </div>
        <div class="card">
            <h2>Recent Activity</h2>
            {activity}
        </div>
        <p class="refresh-info">Auto-refreshes every 5 seconds</p>
    </div>
</body>
</html>"#,
        style = PAGE_STYLE,
        class = status_class(transfer.tone),
        status = transfer.phase,
        details = details,
        timestamp = view.timestamp.format("%Y-%m-%d %H:%M:%S"),
        sync_details = sync_details,
        activity = activity,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::render_phase;
    use pebl_common::{ProgressRecord, SyncMode};

    fn view(phase: Phase) -> DashboardView {
        DashboardView {
            timestamp: Local::now(),
            transfer: render_phase(phase, &ProgressRecord::default(), false),
            sync: SyncView {
                mode: SyncMode::Nightly,
                mode_label: "Night Mode".to_string(),
                schedule: "Sync active (22:00 - 6:00)".to_string(),
                in_window: true,
                destination: "Destination: gdrive:RaPi-PEBL-Sync".to_string(),
                account: "Google Drive: Connecting...".to_string(),
                storage: String::new(),
                status: "Checking sync status...".to_string(),
                fully_synced: false,
                progress: ProgressDisplay::Pulse,
                stats: String::new(),
            },
            display_dimmed: false,
            last_operation: None,
        }
    }

    fn state(
        phase: Phase,
        notifications_file: PathBuf,
    ) -> (DashboardState, mpsc::Receiver<CommandEnvelope>, watch::Sender<DashboardView>) {
        let (view_tx, view_rx) = watch::channel(view(phase));
        let (command_tx, command_rx) = mpsc::channel(4);
        (
            DashboardState::new(view_rx, command_tx, notifications_file),
            command_rx,
            view_tx,
        )
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"A&B's"</b>"#),
            "&lt;b&gt;&quot;A&amp;B&#39;s&quot;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_render_page_without_activity() {
        let page = render_page(&view(Phase::Idle), &[]);
        assert!(page.contains(r#"<meta http-equiv="refresh" content="5">"#));
        assert!(page.contains(r#"<div class="status idle">IDLE</div>"#));
        assert!(page.contains("No recent activity"));
        assert!(page.contains("Night Mode"));
    }

    #[test]
    fn test_render_page_lists_newest_first() {
        let notifications = vec![
            Notification {
                title: "USB Inserted".to_string(),
                message: "CARD".to_string(),
                time: "2026-05-02T10:00:00.5".to_string(),
            },
            Notification {
                title: "Transfer <Complete>".to_string(),
                message: "12 files".to_string(),
                time: "2026-05-02T10:05:00.5".to_string(),
            },
        ];

        let page = render_page(&view(Phase::Complete), &notifications);
        assert!(page.contains(r#"class="status complete">COMPLETE"#));
        let newest = page.find("Transfer &lt;Complete&gt;").unwrap();
        let oldest = page.find("USB Inserted").unwrap();
        assert!(newest < oldest);
        assert!(page.contains("2026-05-02T10:05:00<"));
    }

    #[tokio::test]
    async fn test_api_status_reports_phase_and_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        std::fs::write(&path, r#"{"title": "Backup", "message": "ok", "time": "t"}"#).unwrap();
        let (state, _commands, view_tx) = state(Phase::Idle, path);

        view_tx.send_replace(view(Phase::Transferring));
        let (headers, Json(response)) = api_status(State(state)).await;

        assert_eq!(headers[0].1, "*");
        assert_eq!(response.status, Phase::Transferring);
        assert_eq!(response.notifications.len(), 1);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "TRANSFERRING");
        assert_eq!(json["transfer"]["progress"]["kind"], "fraction");
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (state, mut commands, _view_tx) = state(Phase::Idle, dir.path().join("absent"));

        let coordinator = tokio::spawn(async move {
            let envelope = commands.recv().await.unwrap();
            assert_eq!(envelope.command, OperatorCommand::Dismount { confirmed: true });
            envelope
                .reply
                .send(OperationResult::success("All devices unmounted - safe to power off"))
                .unwrap();
        });

        let (code, Json(result)) = dismount(State(state), Json(DismountRequest { confirm: true })).await;
        coordinator.await.unwrap();
        assert_eq!(code, StatusCode::OK);
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_dispatch_without_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let (state, commands, _view_tx) = state(Phase::Idle, dir.path().join("absent"));
        drop(commands);

        let (code, Json(result)) = cancel(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!result.success);
    }
}
