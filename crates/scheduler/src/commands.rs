//! Operator command surface: command in, ack out. This sits behind the
//! internal admin boundary; no wire format beyond the channel itself.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use cartridge_core::config::SchedulerConfig;
use cartridge_core::types::EngineJob;

use crate::driver::{JobOutcome, LoopDriver};

/// Commands accepted by the driver's command loop. Tenant-scoped actions
/// travel as guarded jobs; engine-wide controls are direct.
#[derive(Debug)]
pub enum OperatorCommand {
    Start,
    Stop,
    UpdateConfig(SchedulerConfig),
    /// Run one scan immediately, outside the interval.
    RunScan,
    Submit(EngineJob),
}

#[derive(Debug)]
pub struct CommandAck {
    pub accepted: bool,
    pub detail: String,
}

impl CommandAck {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            accepted: true,
            detail: detail.into(),
        }
    }

    fn rejected(detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            detail: detail.into(),
        }
    }
}

type CommandEnvelope = (OperatorCommand, oneshot::Sender<CommandAck>);

/// Cheap cloneable handle for submitting commands to a running loop.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandHandle {
    pub async fn submit(&self, command: OperatorCommand) -> CommandAck {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send((command, ack_tx)).await.is_err() {
            return CommandAck::rejected("command loop is gone");
        }
        ack_rx
            .await
            .unwrap_or_else(|_| CommandAck::rejected("command loop dropped the ack"))
    }
}

/// Spawn the command loop for a driver. Returns the submit handle and the
/// loop task; dropping every handle shuts the loop down.
pub fn spawn_command_loop(driver: LoopDriver) -> (CommandHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CommandEnvelope>(64);

    let task = tokio::spawn(async move {
        while let Some((command, ack)) = rx.recv().await {
            let response = match command {
                OperatorCommand::Start => {
                    driver.start();
                    CommandAck::ok("scheduler started")
                }
                OperatorCommand::Stop => {
                    driver.stop();
                    CommandAck::ok("scheduler stopped")
                }
                OperatorCommand::UpdateConfig(config) => {
                    driver.update_config(config);
                    CommandAck::ok("config queued for next tick")
                }
                OperatorCommand::RunScan => {
                    driver.run_scan().await;
                    CommandAck::ok("scan completed")
                }
                OperatorCommand::Submit(job) => match driver.handle_job(job).await {
                    Ok(JobOutcome::Tick(outcome)) => CommandAck::ok(format!("{outcome:?}")),
                    Ok(JobOutcome::Reply(outcome)) => CommandAck::ok(format!(
                        "classified: {} label(s), {} instance(s) affected",
                        outcome.classification.labels.len(),
                        outcome.affected.len()
                    )),
                    Ok(JobOutcome::Command(detail)) => CommandAck::ok(detail),
                    Err(e) => CommandAck::rejected(e.to_string()),
                },
            };
            let _ = ack.send(response);
        }
        info!("command loop exited");
    });

    (CommandHandle { tx }, task)
}
