//! Message-passing front door to the scheduler.
//!
//! Chat handlers (or the `serve` console) hold a cloneable [`CommandHandle`]
//! and send [`Command`]s to a single dispatcher task that owns the
//! [`Scheduler`]. Replies come back on oneshot channels.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::error::{SchedulerError, SchedulerResult};
use crate::core::types::Requester;
use crate::download::queue::QueueItem;
use crate::download::quota::QuotaRecord;
use crate::scheduler::{Scheduler, SchedulerStatus};

/// Cached regex for matching URLs
/// Compiled once at startup and reused for all requests
#[allow(clippy::unwrap_used)]
static URL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s]+").unwrap());

/// Buffer of the command channel
const COMMAND_BUFFER: usize = 64;

#[derive(Debug)]
pub enum Command {
    Enqueue {
        url: String,
        requester: Requester,
        reply: oneshot::Sender<SchedulerResult<QueueItem>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
    Quota {
        requester: Requester,
        reply: oneshot::Sender<QuotaRecord>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the command channel.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Command>,
}

impl CommandHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> SchedulerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    pub async fn enqueue(&self, url: impl Into<String>, requester: Requester) -> SchedulerResult<QueueItem> {
        let url = url.into();
        self.request(|reply| Command::Enqueue { url, requester, reply }).await?
    }

    pub async fn cancel(&self, id: Uuid) -> SchedulerResult<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn pause(&self) -> SchedulerResult<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> SchedulerResult<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn quota(&self, requester: Requester) -> SchedulerResult<QuotaRecord> {
        self.request(|reply| Command::Quota { requester, reply }).await
    }

    /// Stops the scheduler and the dispatcher. Returns after in-flight
    /// downloads have finished.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Spawns the dispatcher task that owns `scheduler`.
///
/// The task ends after a `Shutdown` command or when every handle is dropped.
pub fn spawn_dispatcher(scheduler: Arc<Scheduler>) -> (CommandHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);

    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Enqueue { url, requester, reply } => {
                    let _ = reply.send(scheduler.enqueue(&url, requester).await);
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(scheduler.cancel(id).await);
                }
                Command::Pause { reply } => {
                    scheduler.pause().await;
                    let _ = reply.send(());
                }
                Command::Resume { reply } => {
                    scheduler.resume().await;
                    let _ = reply.send(());
                }
                Command::Status { reply } => {
                    let _ = reply.send(scheduler.status().await);
                }
                Command::Quota { requester, reply } => {
                    let _ = reply.send(scheduler.quota_usage(requester).await);
                }
                Command::Shutdown { reply } => {
                    scheduler.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        log::info!("Command dispatcher stopped");
    });

    (CommandHandle { tx }, task)
}

/// One line of the `serve` console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Add { requester: Requester, url: String },
    Cancel(Uuid),
    Pause,
    Resume,
    Status,
    Quota(Requester),
    Help,
    Quit,
}

pub const CONSOLE_HELP: &str = "commands: add <requester> <url> | cancel <id> | pause | resume | status | quota <requester> | quit";

/// Parses a console line such as `add 42 https://youtu.be/abc`.
pub fn parse_line(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
    match verb.to_lowercase().as_str() {
        "add" => {
            let requester = parts
                .next()
                .ok_or_else(|| "usage: add <requester> <url>".to_string())?
                .parse::<Requester>()?;
            let url = URL_REGEX
                .find(line)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| "no http(s) URL found".to_string())?;
            Ok(ConsoleCommand::Add { requester, url })
        }
        "cancel" => {
            let raw = parts.next().ok_or_else(|| "usage: cancel <id>".to_string())?;
            Uuid::parse_str(raw)
                .map(ConsoleCommand::Cancel)
                .map_err(|e| format!("invalid id {}: {}", raw, e))
        }
        "pause" => Ok(ConsoleCommand::Pause),
        "resume" => Ok(ConsoleCommand::Resume),
        "status" => Ok(ConsoleCommand::Status),
        "quota" => {
            let requester = parts
                .next()
                .ok_or_else(|| "usage: quota <requester>".to_string())?
                .parse::<Requester>()?;
            Ok(ConsoleCommand::Quota(requester))
        }
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(format!("unknown command: {}", other)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}

/// Reads console commands line by line and writes one reply line each.
///
/// Returns after `quit` or end of input; either way the scheduler is shut
/// down through `handle`.
pub async fn run_console<R, W>(handle: CommandHandle, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match parse_line(&line) {
            Ok(ConsoleCommand::Add { requester, url }) => match handle.enqueue(url, requester).await {
                Ok(item) => format!("queued {} at {}", item.id, item.submitted_at.to_rfc3339()),
                Err(e) => format!("rejected: {}", e),
            },
            Ok(ConsoleCommand::Cancel(id)) => match handle.cancel(id).await {
                Ok(true) => format!("cancelled {}", id),
                Ok(false) => format!("nothing to cancel for {}", id),
                Err(e) => format!("error: {}", e),
            },
            Ok(ConsoleCommand::Pause) => match handle.pause().await {
                Ok(()) => "paused".to_string(),
                Err(e) => format!("error: {}", e),
            },
            Ok(ConsoleCommand::Resume) => match handle.resume().await {
                Ok(()) => "resumed".to_string(),
                Err(e) => format!("error: {}", e),
            },
            Ok(ConsoleCommand::Status) => match handle.status().await {
                Ok(status) => to_json(&status),
                Err(e) => format!("error: {}", e),
            },
            Ok(ConsoleCommand::Quota(requester)) => match handle.quota(requester).await {
                Ok(record) => to_json(&record),
                Err(e) => format!("error: {}", e),
            },
            Ok(ConsoleCommand::Help) => CONSOLE_HELP.to_string(),
            Ok(ConsoleCommand::Quit) => break,
            Err(e) => format!("error: {}", e),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    if let Err(e) = handle.shutdown().await {
        log::debug!("Shutdown after console exit: {}", e);
    }
    output.write_all(b"bye\n").await?;
    output.flush().await
}
