//! Line-delimited JSON transport for command events.
//!
//! Each input line is one [`CommandEvent`]. Every event is dispatched on its
//! own task; replies are written back as one JSON object per line. A line
//! that cannot be decoded is skipped, and a failing input ends reading but
//! never cuts off commands that were already admitted.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{CommandContext, PermissionSet, Reply, Responder};
use crate::error::Result;
use crate::gate::{AdmissionGate, DispatchOutcome};

/// An inbound command as delivered by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    pub command: String,
    pub user_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub permissions: PermissionSet,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandEvent {
    pub fn into_context(self) -> CommandContext {
        CommandContext {
            event_id: Uuid::new_v4(),
            command: self.command,
            user_id: self.user_id,
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            permissions: self.permissions,
            args: self.args,
        }
    }
}

/// A reply as written to the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub event_id: Uuid,
    pub kind: ReplyKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Text,
    Denied,
    Failed,
}

impl OutboundReply {
    pub fn new(ctx: &CommandContext, reply: &Reply) -> Self {
        let kind = match reply {
            Reply::Text(_) => ReplyKind::Text,
            Reply::Denied(_) => ReplyKind::Denied,
            Reply::Failed => ReplyKind::Failed,
        };
        Self {
            event_id: ctx.event_id,
            kind,
            content: reply.content(),
        }
    }
}

/// Writes replies as JSON lines to any async writer.
pub struct JsonLinesResponder<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesResponder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Responder for JsonLinesResponder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, ctx: &CommandContext, reply: Reply) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&OutboundReply::new(ctx, &reply))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Counters describing one ingress run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub received: usize,
    pub malformed: usize,
    pub dropped: usize,
    pub denied: usize,
    pub completed: usize,
    pub failed: usize,
}

impl IngressStats {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Dropped => self.dropped += 1,
            DispatchOutcome::Denied(_) => self.denied += 1,
            DispatchOutcome::Completed => self.completed += 1,
            DispatchOutcome::Failed => self.failed += 1,
        }
    }
}

/// Reads command events and dispatches each on its own task.
pub struct Ingress {
    gate: Arc<AdmissionGate>,
    responder: Arc<dyn Responder>,
}

impl Ingress {
    pub fn new(gate: Arc<AdmissionGate>, responder: Arc<dyn Responder>) -> Self {
        Self { gate, responder }
    }

    /// Serve until the input is exhausted.
    pub async fn serve<R>(self, reader: R) -> Result<IngressStats>
    where
        R: AsyncBufRead + Unpin,
    {
        self.serve_with_shutdown(reader, std::future::pending()).await
    }

    /// Serve until the input is exhausted or `signal` resolves, then wait for
    /// in-flight commands to finish.
    pub async fn serve_with_shutdown<R, F>(self, reader: R, signal: F) -> Result<IngressStats>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = SplitStream::new(reader.split(b'\n'));
        let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut stats = IngressStats::default();
        tokio::pin!(signal);

        info!("Ingress started");

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!(in_flight = tasks.len(), "Shutdown requested, no longer reading events");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_join(&mut stats, joined);
                }
                line = lines.next() => {
                    let raw = match line {
                        Some(Ok(raw)) => raw,
                        Some(Err(e)) => {
                            error!(error = %e, in_flight = tasks.len(), "Failed to read input, no longer reading events");
                            break;
                        }
                        None => {
                            debug!("Input exhausted");
                            break;
                        }
                    };
                    let line = raw.strip_suffix(b"\r").unwrap_or(&raw);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    stats.received += 1;

                    let event = match serde_json::from_slice::<CommandEvent>(line) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed command event");
                            stats.malformed += 1;
                            continue;
                        }
                    };

                    let gate = self.gate.clone();
                    let responder = self.responder.clone();
                    tasks.spawn(async move {
                        let ctx = event.into_context();
                        gate.dispatch(&ctx, responder.as_ref()).await
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record_join(&mut stats, joined);
        }

        info!(
            received = stats.received,
            completed = stats.completed,
            denied = stats.denied,
            failed = stats.failed,
            "Ingress stopped"
        );
        Ok(stats)
    }
}

fn record_join(
    stats: &mut IngressStats,
    joined: std::result::Result<DispatchOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => stats.record(&outcome),
        Err(e) => {
            error!(error = %e, "Dispatch task aborted");
            stats.failed += 1;
        }
    }
}
