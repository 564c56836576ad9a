// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote commands issued by the API and executed through external DMR tools.

use crate::delivery::DeliveryClient;
use crate::errors::{CommandError, DeliveryError};
use crate::records::Payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SMS_TOOL: &str = "dmr-sms-send";
const CALL_ALERT_TOOL: &str = "dmr-call-alert";
const GPS_REQUEST_TOOL: &str = "dmr-gps-request";
const REMOTE_MONITOR_TOOL: &str = "dmr-remote-monitor";

const DEFAULT_MONITOR_SECS: u64 = 30;
/// Added to the monitor duration to get the tool timeout.
const MONITOR_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Command {
    pub id: u64,
    pub command_type: String,
    #[serde(default)]
    pub target_radio_id: Option<u32>,
    #[serde(default)]
    pub target_talkgroup_id: Option<u32>,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Command {
    fn payload_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.as_ref().and_then(|payload| payload.get(key))
    }

    fn target_radio(&self) -> Option<u32> {
        self.target_radio_id.filter(|id| *id != 0)
    }

    fn target_talkgroup(&self) -> Option<u32> {
        self.target_talkgroup_id.filter(|id| *id != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Failed,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Completed => f.write_str("completed"),
            CommandStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result of running one external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The tool is not installed on this host.
    Unavailable,
    Succeeded,
    Failed(String),
}

/// How a missing tool is reported back to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Report `completed` so the API does not keep re-issuing the command.
    #[default]
    TreatAsSuccess,
    TreatAsFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: &'static str,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> ToolOutcome;
}

/// Runs tools as child processes, killed when the timeout elapses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> ToolOutcome {
        let output = tokio::process::Command::new(invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(invocation.timeout, output).await {
            Err(_) => ToolOutcome::Failed(format!("{} timeout", invocation.program)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => ToolOutcome::Unavailable,
            Ok(Err(e)) => ToolOutcome::Failed(format!("{}: {e}", invocation.program)),
            Ok(Ok(output)) if output.status.success() => ToolOutcome::Succeeded,
            Ok(Ok(output)) => ToolOutcome::Failed(format!(
                "{} failed: {}",
                invocation.program,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub status: CommandStatus,
    pub error_message: Option<String>,
}

impl CommandReport {
    fn completed() -> Self {
        CommandReport {
            status: CommandStatus::Completed,
            error_message: None,
        }
    }

    fn failed(reason: String) -> Self {
        CommandReport {
            status: CommandStatus::Failed,
            error_message: Some(reason),
        }
    }
}

pub struct CommandExecutor<R = ProcessRunner> {
    dmr_id: u32,
    tool_timeout: Duration,
    unavailable_policy: UnavailablePolicy,
    runner: R,
}

impl<R: ToolRunner> CommandExecutor<R> {
    pub fn new(
        dmr_id: u32,
        tool_timeout: Duration,
        unavailable_policy: UnavailablePolicy,
        runner: R,
    ) -> Self {
        CommandExecutor {
            dmr_id,
            tool_timeout,
            unavailable_policy,
            runner,
        }
    }

    /// Maps a command onto the tool invocation that carries it out.
    pub fn plan(&self, command: &Command) -> Result<ToolInvocation, CommandError> {
        let source = self.dmr_id.to_string();
        match command.command_type.as_str() {
            "sms" => {
                let message = command
                    .payload_field("message")
                    .and_then(serde_json::Value::as_str)
                    .filter(|message| !message.is_empty())
                    .ok_or(CommandError::InvalidCommand("No message provided"))?;
                let target = match (command.target_radio(), command.target_talkgroup()) {
                    (Some(radio), _) => format!("PC{radio}"),
                    (None, Some(talkgroup)) => format!("TG{talkgroup}"),
                    (None, None) => return Err(CommandError::InvalidCommand("No target specified")),
                };
                info!("COMMANDS | Sending SMS to {target}: {message}");
                Ok(ToolInvocation {
                    program: SMS_TOOL,
                    args: vec![
                        "--source".to_string(),
                        source,
                        "--target".to_string(),
                        target,
                        "--message".to_string(),
                        message.to_string(),
                    ],
                    timeout: self.tool_timeout,
                })
            }
            // A radio check is a call alert whose acknowledgement is the answer.
            "call_alert" | "radio_check" => self.targeted(command, CALL_ALERT_TOOL, source),
            "gps_request" => self.targeted(command, GPS_REQUEST_TOOL, source),
            "remote_monitor" => {
                let duration = command
                    .payload_field("duration")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(DEFAULT_MONITOR_SECS);
                let mut invocation = self.targeted(command, REMOTE_MONITOR_TOOL, source)?;
                warn!(
                    "COMMANDS | Remote monitor request in command {} (duration: {duration}s)",
                    command.id
                );
                invocation.args.push("--duration".to_string());
                invocation.args.push(duration.to_string());
                invocation.timeout = Duration::from_secs(duration) + MONITOR_GRACE;
                Ok(invocation)
            }
            other => Err(CommandError::UnknownType(other.to_string())),
        }
    }

    fn targeted(
        &self,
        command: &Command,
        program: &'static str,
        source: String,
    ) -> Result<ToolInvocation, CommandError> {
        let target = command
            .target_radio()
            .ok_or(CommandError::InvalidCommand("No target radio specified"))?;
        Ok(ToolInvocation {
            program,
            args: vec![
                "--source".to_string(),
                source,
                "--target".to_string(),
                target.to_string(),
            ],
            timeout: self.tool_timeout,
        })
    }

    pub async fn execute(&self, command: &Command) -> CommandReport {
        let invocation = match self.plan(command) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("COMMANDS | Command {} rejected: {e}", command.id);
                return CommandReport::failed(e.to_string());
            }
        };

        match self.runner.run(&invocation).await {
            ToolOutcome::Succeeded => {
                info!(
                    "COMMANDS | {} succeeded for command {}",
                    invocation.program, command.id
                );
                CommandReport::completed()
            }
            ToolOutcome::Unavailable => match self.unavailable_policy {
                UnavailablePolicy::TreatAsSuccess => {
                    info!(
                        "COMMANDS | {} not available, reporting command {} as completed",
                        invocation.program, command.id
                    );
                    CommandReport::completed()
                }
                UnavailablePolicy::TreatAsFailure => {
                    CommandReport::failed(format!("{} not available", invocation.program))
                }
            },
            ToolOutcome::Failed(reason) => {
                error!("COMMANDS | Command {} failed: {reason}", command.id);
                CommandReport::failed(reason)
            }
        }
    }
}

/// Where commands come from and where their results go.
#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn fetch(&self) -> Vec<Command>;
    async fn report(
        &self,
        id: u64,
        status: CommandStatus,
        error_message: Option<&str>,
    ) -> Result<(), DeliveryError>;
}

#[async_trait]
impl CommandSource for DeliveryClient {
    async fn fetch(&self) -> Vec<Command> {
        self.fetch_commands().await
    }

    async fn report(
        &self,
        id: u64,
        status: CommandStatus,
        error_message: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.report_command(id, status, error_message).await
    }
}

pub struct CommandPoller<S, R = ProcessRunner> {
    source: S,
    executor: CommandExecutor<R>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl<S: CommandSource, R: ToolRunner> CommandPoller<S, R> {
    pub fn new(
        source: S,
        executor: CommandExecutor<R>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        CommandPoller {
            source,
            executor,
            interval,
            cancel_token,
        }
    }

    /// Fetches, executes and reports every pending command once. Returns
    /// how many commands were processed.
    pub async fn poll_once(&self) -> usize {
        let commands = self.source.fetch().await;
        for command in &commands {
            info!(
                "COMMANDS | Executing command {}: {}",
                command.id, command.command_type
            );
            let report = self.executor.execute(command).await;
            if let Err(e) = self
                .source
                .report(command.id, report.status, report.error_message.as_deref())
                .await
            {
                error!("COMMANDS | Failed to post result of command {}: {e}", command.id);
            }
        }
        commands.len()
    }

    pub async fn spin(self) {
        info!("COMMANDS | Started command polling every {:?}", self.interval);
        while !self.cancel_token.is_cancelled() {
            self.poll_once().await;
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("COMMANDS | Stopped command polling");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn command(value: serde_json::Value) -> Command {
        serde_json::from_value(value).unwrap()
    }

    #[derive(Clone, Default)]
    struct FakeRunner {
        outcome: Option<ToolOutcome>,
        calls: Arc<Mutex<Vec<ToolInvocation>>>,
    }

    #[async_trait]
    impl ToolRunner for FakeRunner {
        async fn run(&self, invocation: &ToolInvocation) -> ToolOutcome {
            self.calls.lock().unwrap().push(invocation.clone());
            self.outcome.clone().unwrap_or(ToolOutcome::Succeeded)
        }
    }

    fn executor(outcome: ToolOutcome, policy: UnavailablePolicy) -> CommandExecutor<FakeRunner> {
        CommandExecutor::new(
            2_222_000,
            Duration::from_secs(10),
            policy,
            FakeRunner {
                outcome: Some(outcome),
                calls: Arc::default(),
            },
        )
    }

    #[test]
    fn test_plan_sms_prefers_private_target() {
        let executor = executor(ToolOutcome::Succeeded, UnavailablePolicy::default());
        let invocation = executor
            .plan(&command(json!({
                "id": 1,
                "command_type": "sms",
                "target_radio_id": 3100001,
                "target_talkgroup_id": 91,
                "payload": {"message": "return to base"}
            })))
            .unwrap();

        assert_eq!(invocation.program, "dmr-sms-send");
        assert_eq!(
            invocation.args,
            vec!["--source", "2222000", "--target", "PC3100001", "--message", "return to base"]
        );
        assert_eq!(invocation.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_plan_sms_to_talkgroup_and_errors() {
        let executor = executor(ToolOutcome::Succeeded, UnavailablePolicy::default());
        let invocation = executor
            .plan(&command(json!({
                "id": 1, "command_type": "sms", "target_talkgroup_id": 91,
                "payload": {"message": "hi"}
            })))
            .unwrap();
        assert_eq!(invocation.args[3], "TG91");

        assert_eq!(
            executor.plan(&command(json!({
                "id": 2, "command_type": "sms", "target_talkgroup_id": 91, "payload": {}
            }))),
            Err(CommandError::InvalidCommand("No message provided"))
        );
        assert_eq!(
            executor.plan(&command(json!({
                "id": 3, "command_type": "sms", "payload": {"message": "hi"}
            }))),
            Err(CommandError::InvalidCommand("No target specified"))
        );
    }

    #[test]
    fn test_plan_radio_check_uses_call_alert() {
        let executor = executor(ToolOutcome::Succeeded, UnavailablePolicy::default());
        let invocation = executor
            .plan(&command(json!({"id": 1, "command_type": "radio_check", "target_radio_id": 42})))
            .unwrap();
        assert_eq!(invocation.program, "dmr-call-alert");
        assert_eq!(invocation.args, vec!["--source", "2222000", "--target", "42"]);

        assert_eq!(
            executor.plan(&command(json!({"id": 1, "command_type": "gps_request"}))),
            Err(CommandError::InvalidCommand("No target radio specified"))
        );
    }

    #[test]
    fn test_plan_remote_monitor_extends_timeout() {
        let executor = executor(ToolOutcome::Succeeded, UnavailablePolicy::default());
        let invocation = executor
            .plan(&command(json!({
                "id": 1, "command_type": "remote_monitor", "target_radio_id": 42,
                "payload": {"duration": 60}
            })))
            .unwrap();
        assert_eq!(invocation.program, "dmr-remote-monitor");
        assert_eq!(&invocation.args[4..], ["--duration", "60"]);
        assert_eq!(invocation.timeout, Duration::from_secs(70));

        let invocation = executor
            .plan(&command(json!({"id": 1, "command_type": "remote_monitor", "target_radio_id": 42})))
            .unwrap();
        assert_eq!(invocation.timeout, Duration::from_secs(40));
    }

    #[test]
    fn test_plan_unknown_type() {
        let executor = executor(ToolOutcome::Succeeded, UnavailablePolicy::default());
        let error = executor
            .plan(&command(json!({"id": 1, "command_type": "reboot"})))
            .unwrap_err();
        assert_eq!(error.to_string(), "Unknown command type: reboot");
    }

    #[tokio::test]
    async fn test_unavailable_policy_is_explicit() {
        let cmd = command(json!({"id": 9, "command_type": "call_alert", "target_radio_id": 5}));

        let lenient = executor(ToolOutcome::Unavailable, UnavailablePolicy::TreatAsSuccess);
        assert_eq!(lenient.execute(&cmd).await.status, CommandStatus::Completed);

        let strict = executor(ToolOutcome::Unavailable, UnavailablePolicy::TreatAsFailure);
        let report = strict.execute(&cmd).await;
        assert_eq!(report.status, CommandStatus::Failed);
        assert_eq!(report.error_message.as_deref(), Some("dmr-call-alert not available"));
    }

    #[tokio::test]
    async fn test_failed_tool_and_rejected_command() {
        let failing = executor(
            ToolOutcome::Failed("dmr-gps-request failed: no ack".to_string()),
            UnavailablePolicy::default(),
        );
        let report = failing
            .execute(&command(json!({"id": 1, "command_type": "gps_request", "target_radio_id": 5})))
            .await;
        assert_eq!(report.status, CommandStatus::Failed);
        assert_eq!(report.error_message.as_deref(), Some("dmr-gps-request failed: no ack"));

        let report = failing
            .execute(&command(json!({"id": 2, "command_type": "selfdestruct"})))
            .await;
        assert_eq!(
            report.error_message.as_deref(),
            Some("Unknown command type: selfdestruct")
        );
        assert_eq!(failing.runner.calls.lock().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_outcomes() {
        let invocation = |program: &'static str, args: &[&str], timeout_ms: u64| ToolInvocation {
            program,
            args: args.iter().map(ToString::to_string).collect(),
            timeout: Duration::from_millis(timeout_ms),
        };
        let runner = ProcessRunner;

        assert_eq!(runner.run(&invocation("true", &[], 5_000)).await, ToolOutcome::Succeeded);
        assert!(matches!(
            runner.run(&invocation("false", &[], 5_000)).await,
            ToolOutcome::Failed(_)
        ));
        assert_eq!(
            runner
                .run(&invocation("dmr-tool-that-does-not-exist", &[], 5_000))
                .await,
            ToolOutcome::Unavailable
        );
        assert_eq!(
            runner.run(&invocation("sleep", &["5"], 50)).await,
            ToolOutcome::Failed("sleep timeout".to_string())
        );
    }

    #[derive(Default)]
    struct FakeSource {
        commands: Vec<Command>,
        reports: Mutex<Vec<(u64, CommandStatus, Option<String>)>>,
    }

    #[async_trait]
    impl CommandSource for FakeSource {
        async fn fetch(&self) -> Vec<Command> {
            self.commands.clone()
        }

        async fn report(
            &self,
            id: u64,
            status: CommandStatus,
            error_message: Option<&str>,
        ) -> Result<(), DeliveryError> {
            self.reports
                .lock()
                .unwrap()
                .push((id, status, error_message.map(str::to_string)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poll_once_reports_every_command() {
        let source = FakeSource {
            commands: vec![
                command(json!({"id": 1, "command_type": "call_alert", "target_radio_id": 5})),
                command(json!({"id": 2, "command_type": "call_alert"})),
            ],
            ..FakeSource::default()
        };
        let poller = CommandPoller::new(
            source,
            executor(ToolOutcome::Succeeded, UnavailablePolicy::default()),
            Duration::from_secs(30),
            CancellationToken::new(),
        );

        assert_eq!(poller.poll_once().await, 2);

        let reports = poller.source.reports.lock().unwrap().clone();
        assert_eq!(
            reports,
            vec![
                (1, CommandStatus::Completed, None),
                (
                    2,
                    CommandStatus::Failed,
                    Some("No target radio specified".to_string())
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_spin_exits_on_cancel() {
        let cancel_token = CancellationToken::new();
        let poller = CommandPoller::new(
            FakeSource::default(),
            executor(ToolOutcome::Succeeded, UnavailablePolicy::default()),
            Duration::from_secs(3600),
            cancel_token.clone(),
        );
        let handle = tokio::spawn(poller.spin());
        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
