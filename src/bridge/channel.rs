//! Transport layer under the bridge.
//!
//! A [`Connector`] hands out a connected pair of message pumps; the
//! production implementation spawns the native host process and speaks the
//! length-prefixed framing over its stdio, with a reader task and a writer
//! task pumping between the pipes and in-process channels. Tests plug in
//! scripted connectors instead.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{read_frame, write_frame, CodecError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn native host process")]
    Spawn(#[source] std::io::Error),
    #[error("native host stdio unavailable")]
    MissingStdio,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A live connection: messages written to `outbound` reach the host, host
/// messages arrive on `inbound`. The inbound side closing signals disconnect.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Value>,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

/// Produces connections to the native host. One attempt per call; retry
/// policy lives above this trait.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ChannelError>;
}

/// Spawns the native host executable and frames messages over its stdio.
pub struct HostProcessConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl HostProcessConnector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl Connector for HostProcessConnector {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(ChannelError::Spawn)?;
        let stdin = child.stdin.take().ok_or(ChannelError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(ChannelError::MissingStdio)?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_pump(stdin, out_rx));
        tokio::spawn(read_pump(child, stdout, in_tx));

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn write_pump(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(msg) = rx.recv().await {
        if let Err(err) = write_frame(&mut stdin, &msg).await {
            warn!(error = %err, "writing to native host failed");
            break;
        }
    }
}

async fn read_pump(mut child: Child, stdout: ChildStdout, tx: mpsc::UnboundedSender<Value>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(msg)) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("native host closed its pipe");
                break;
            }
            Err(err) => {
                warn!(error = %err, "reading from native host failed");
                break;
            }
        }
    }
    match child.wait().await {
        Ok(status) => debug!(%status, "native host exited"),
        Err(err) => warn!(error = %err, "failed to reap native host"),
    }
}

/// Owns the single connection to the host. The epoch ties reader tasks to
/// the connection they were spawned for, so a stale task cannot tear down a
/// newer connection's state.
pub(crate) struct MessageChannel {
    outbound: Option<mpsc::UnboundedSender<Value>>,
    epoch: u64,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self {
            outbound: None,
            epoch: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.outbound.is_some() && self.epoch == epoch
    }

    /// Adopt a freshly connected outbound pump; returns the new epoch.
    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<Value>) -> u64 {
        self.epoch += 1;
        self.outbound = Some(outbound);
        self.epoch
    }

    /// Drop the connection if `epoch` still refers to it.
    pub fn detach(&mut self, epoch: u64) -> bool {
        if self.epoch == epoch && self.outbound.is_some() {
            self.outbound = None;
            true
        } else {
            false
        }
    }

    /// Detach unconditionally (used when a send on the current connection
    /// fails). Returns the epoch that was dropped.
    pub fn detach_current(&mut self) -> u64 {
        self.outbound = None;
        self.epoch
    }

    pub fn send(&mut self, msg: Value) -> Result<(), ChannelError> {
        match &self.outbound {
            Some(tx) => tx.send(msg).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }
}
