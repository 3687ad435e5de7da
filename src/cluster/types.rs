use super::protocol::NodeSummary;
use crate::wire::{Command, Message};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

/// Numeric worker id, chosen by the worker itself at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(WorkerId)
    }
}

/// Identifies one connection of a worker.
///
/// A worker that reconnects under the same id gets a new session, so events
/// still in flight from the old connection can be told apart and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque id of one pending search, echoed back by workers in FND/NFD.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    const LETTERS: &'static [u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const LEN: usize = 13;

    /// Generates a random 13-letter id.
    pub fn new() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self(
            (0..Self::LEN)
                .map(|_| Self::LETTERS[rng.gen_range(0..Self::LETTERS.len())] as char)
                .collect(),
        )
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReply {
    Alive,
    NotAlive,
}

/// Coordinator-side record of one connected worker. Owned by the registry.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub session: SessionId,
    pub addr: Option<SocketAddr>,
    /// Commands queued for the session's writer task.
    pub outbound: mpsc::UnboundedSender<Message>,
    /// ALV/NAL replies, consumed by the session's heartbeat task.
    pub heartbeat: mpsc::Sender<HeartbeatReply>,
    /// Chunk names present in the worker's directory.
    pub chunk_files: BTreeSet<String>,
    /// Chunk names the worker holds in memory, as last known to the coordinator.
    pub memory_files: BTreeSet<String>,
}

impl WorkerHandle {
    /// Queues a command for the worker. Returns false once its writer is gone.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            name: self.id.to_string(),
            chunks: self.chunk_files.iter().cloned().collect(),
            memory: self.memory_files.iter().cloned().collect(),
        }
    }
}

/// A search waiting for its definitive answer.
#[derive(Debug)]
pub struct ClientRequest {
    pub id: ClientId,
    pub query: String,
    /// Receives the result line followed by a terminal EXT.
    pub reply: mpsc::UnboundedSender<Message>,
    /// NFD replies received so far.
    pub not_found: usize,
    /// Number of workers the query was sent to.
    pub expected: usize,
    /// Timer that expires the request; cancelled once it completes.
    pub expiry: tokio::task::AbortHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(WorkerId),
    NotFound,
}

impl SearchOutcome {
    /// The line delivered to a search client: `FND*|*<id>` or `NFD*|*0`.
    pub fn to_message(self) -> Message {
        match self {
            SearchOutcome::Found(worker) => {
                Message::with_fields(Command::Found, [worker.to_string()])
            }
            SearchOutcome::NotFound => Message::with_fields(Command::NotFound, ["0"]),
        }
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        match message.command {
            Command::Found => message
                .field(0)
                .ok()
                .and_then(|id| id.parse().ok())
                .map(SearchOutcome::Found),
            Command::NotFound => Some(SearchOutcome::NotFound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Accepted,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveCause {
    /// The worker announced EXT.
    Exit,
    ConnectionLost,
    HeartbeatTimeout,
    ProtocolError,
}

impl fmt::Display for LeaveCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self {
            LeaveCause::Exit => "exit",
            LeaveCause::ConnectionLost => "connection lost",
            LeaveCause::HeartbeatTimeout => "heartbeat timeout",
            LeaveCause::ProtocolError => "protocol error",
        };
        f.write_str(cause)
    }
}

/// Everything the registry loop reacts to.
#[derive(Debug)]
pub enum RegistryEvent {
    /// A connection announced `id`; reserve it or reject it as a duplicate.
    Claim {
        id: WorkerId,
        session: SessionId,
        reply: oneshot::Sender<JoinDecision>,
    },
    /// Handshake finished; place chunks, then admit the worker.
    Joined {
        handle: WorkerHandle,
        admitted: oneshot::Sender<()>,
    },
    /// A message read from a worker connection.
    Inbound {
        worker: WorkerId,
        session: SessionId,
        message: Message,
    },
    Left {
        worker: WorkerId,
        session: SessionId,
        cause: LeaveCause,
    },
    Search {
        query: String,
        reply: mpsc::UnboundedSender<Message>,
    },
    SearchExpired {
        client: ClientId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<NodeSummary>>,
    },
}
