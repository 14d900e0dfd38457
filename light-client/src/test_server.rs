//! Scripted stand-in for a boblight server, driven over in-memory streams.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{BoxedStream, LightClientError, StreamOpener};

/// Canned replies, per command. Each command answers with its queued reply
/// batches in order; the last batch repeats.
#[derive(Default)]
pub(crate) struct Script {
    replies: HashMap<String, VecDeque<Vec<String>>>,
}

impl Script {
    /// A server that completes the handshake and exposes `lights`.
    pub fn handshake(lights: &[&str]) -> Self {
        let mut enumeration = vec![format!("lights {}", lights.len())];
        enumeration.extend(
            lights
                .iter()
                .map(|light| format!("light {light} scan 0.0 100.0 0.0 100.0")),
        );
        let enumeration: Vec<_> = enumeration.iter().map(String::as_str).collect();

        Self::default()
            .reply("hello", &["hello"])
            .reply("get version", &["5"])
            .reply("get lights", &enumeration)
    }

    pub fn reply(mut self, command: &str, lines: &[&str]) -> Self {
        self.replies
            .entry(command.to_owned())
            .or_default()
            .push_back(lines.iter().map(|line| line.to_string()).collect());
        self
    }

    /// Replaces whatever was scripted for `command`.
    pub fn replace(mut self, command: &str, lines: &[&str]) -> Self {
        self.replies.remove(command);
        self.reply(command, lines)
    }

    pub fn silent(mut self, command: &str) -> Self {
        self.replies.remove(command);
        self
    }

    fn replies_for(&mut self, command: &str) -> Vec<String> {
        match self.replies.get_mut(command) {
            Some(batches) if batches.len() > 1 => batches.pop_front().unwrap_or_default(),
            Some(batches) => batches.front().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

pub(crate) struct FakeServer {
    commands: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl FakeServer {
    /// Returns the client end of the connection along with the server.
    pub fn spawn(script: Script) -> (DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(4096);
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(server, script, commands));
        (
            client,
            Self {
                commands: receiver,
                task,
            },
        )
    }

    /// The next command the client sent, or `None` once the client is gone.
    pub async fn next_command(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), self.commands.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skips the handshake commands.
    pub async fn skip_handshake(&mut self) {
        for expected in ["hello", "get version", "get lights"] {
            assert_eq!(self.next_command().await.as_deref(), Some(expected));
        }
        let priority = self.next_command().await.unwrap_or_default();
        assert!(priority.starts_with("set priority "), "{priority}");
    }

    /// Drops the connection from the server side.
    pub fn hang_up(&self) {
        self.task.abort();
    }
}

async fn serve(stream: DuplexStream, mut script: Script, commands: mpsc::UnboundedSender<String>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let replies = script.replies_for(&line);
        let _ = commands.send(line);
        for reply in replies {
            if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Hands out prepared streams, one per connection attempt. Refuses to connect
/// once they run out.
pub(crate) struct FakeOpener {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl FakeOpener {
    pub fn new(streams: impl IntoIterator<Item = DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into_iter().collect()),
        }
    }

    pub fn refusing() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl StreamOpener for FakeOpener {
    async fn open(&self, _host: &str, _port: u16) -> Result<BoxedStream, LightClientError> {
        let stream = self.streams.lock().unwrap().pop_front();
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(LightClientError::ConnectionFailed {
                reason: "connection refused".into(),
            }),
        }
    }
}
