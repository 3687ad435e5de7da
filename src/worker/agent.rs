//! Worker Command Loop
//!
//! Reads coordinator commands line by line and dispatches each one. Cheap
//! commands (HBT, ABT, EXT) are answered inline; searches and chunk loads run
//! in their own tasks so a long scan never delays a heartbeat reply.
//!
//! ## Ordering
//! LOD, ULD and the dataset snapshot of every SRH go through one queue drained
//! by a single task, so each change and each search sees every change that
//! arrived before it. Only the scan itself runs off that queue.
//!
//! ## Abort handling
//! Status is not a flag that SRH and ABT overwrite. Each SRH records the
//! current abort epoch when it is dispatched and ABT advances the epoch; a scan
//! stops as soon as the epoch it started under is gone. The worker is BUSY
//! while at least one scan is in flight.

use super::dataset::{Chunk, Dataset, list_chunk_files, read_chunk, scan};
use super::types::{ScanOutcome, Shutdown, WorkerStatus};
use crate::config::WorkerConfig;
use crate::wire::{Command, Message, decode, join_names, write_messages};

use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};

/// How long a disconnecting worker waits for queued replies to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct WorkerAgent {
    id: u32,
    chunk_dir: PathBuf,
    chunk_files: Vec<String>,
    state: Arc<AgentState>,
}

/// State shared between the command loop and the tasks it spawns.
#[derive(Default)]
struct AgentState {
    dataset: RwLock<Dataset>,
    in_flight: AtomicUsize,
    abort_epoch: AtomicU64,
}

/// Work that must observe the dataset in arrival order.
enum Change {
    Load(Vec<String>),
    Unload(Vec<String>),
    /// Takes the snapshot for a search dispatched under `epoch`.
    Search {
        query: String,
        client_id: String,
        epoch: u64,
    },
}

impl AgentState {
    /// Registers a new scan and returns the epoch it runs under.
    fn begin_search(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.abort_epoch.load(Ordering::SeqCst)
    }

    fn finish_search(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn is_aborted(&self, epoch: u64) -> bool {
        self.abort_epoch.load(Ordering::SeqCst) != epoch
    }

    async fn load(&self, dir: &Path, names: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        {
            let dataset = self.dataset.read().await;
            let mut seen = HashSet::new();
            for name in names {
                if !dataset.contains(name) && seen.insert(name.as_str()) {
                    missing.push(name);
                }
            }
        }

        let mut loaded = Vec::with_capacity(missing.len());
        for name in missing {
            loaded.push(read_chunk(dir, name).await?);
        }

        let mut dataset = self.dataset.write().await;
        for chunk in loaded {
            dataset.insert(chunk);
        }
        Ok(dataset.names())
    }

    async fn unload(&self, names: &[String]) -> Vec<String> {
        let mut dataset = self.dataset.write().await;
        for name in names {
            if !dataset.remove(name) {
                tracing::debug!("Chunk [{}] was not resident, nothing to unload", name);
            }
        }
        dataset.names()
    }
}

impl WorkerAgent {
    /// Builds an agent from its configuration, enumerating the chunk directory.
    pub async fn new(config: &WorkerConfig) -> Result<Self> {
        let chunk_dir = config.chunk_dir();
        let chunk_files = list_chunk_files(&chunk_dir).await?;
        if chunk_files.is_empty() {
            bail!("no chunk files in {}", chunk_dir.display());
        }

        tracing::info!(
            "Worker [{}] found {} chunk files in {}",
            config.id,
            chunk_files.len(),
            chunk_dir.display()
        );

        Ok(Self::with_chunks(config.id, chunk_dir, chunk_files))
    }

    pub fn with_chunks(id: u32, chunk_dir: PathBuf, chunk_files: Vec<String>) -> Self {
        Self {
            id,
            chunk_dir,
            chunk_files,
            state: Arc::new(AgentState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn chunk_files(&self) -> &[String] {
        &self.chunk_files
    }

    pub fn status(&self) -> WorkerStatus {
        if self.state.in_flight.load(Ordering::SeqCst) > 0 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Free
        }
    }

    /// Names of the chunks currently resident in memory.
    pub async fn memory_files(&self) -> Vec<String> {
        self.state.dataset.read().await.names()
    }

    /// Connects to the coordinator and runs the session until it ends.
    pub async fn connect(&self, coordinator: SocketAddr) -> Result<Shutdown> {
        let stream = TcpStream::connect(coordinator)
            .await
            .with_context(|| format!("failed to connect to coordinator at {}", coordinator))?;
        tracing::info!("Connection with coordinator {} established", coordinator);

        let (reader, writer) = stream.into_split();
        self.serve(BufReader::new(reader), writer).await
    }

    /// Runs the handshake and then the command loop over an established stream.
    ///
    /// Returns `Ok` when the coordinator orders an exit or goes away, and `Err`
    /// on any protocol violation or local failure, both of which are fatal.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<Shutdown>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = reader.lines();

        writer.write_all(format!("{}\n", self.id).as_bytes()).await?;
        let reply = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("coordinator closed the connection during handshake"))?;
        let duplicate = reply == Command::Duplicate.code();
        if duplicate {
            tracing::error!("Worker with id [{}] is already present in the cluster", self.id);
        }
        let listing = format!("{}\n", join_names(&self.chunk_files));
        if let Err(e) = writer.write_all(listing.as_bytes()).await {
            if duplicate {
                tracing::warn!("Coordinator dropped the rejected session: {}", e);
                return Ok(Shutdown::Disconnected);
            }
            return Err(e.into());
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let id = self.id;
        let writer_task = tokio::spawn(async move {
            if let Err(e) = write_messages(writer, outbound_rx).await {
                tracing::warn!("Worker [{}] failed to write to coordinator: {}", id, e);
            }
        });
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let (changes, changes_rx) = mpsc::unbounded_channel::<Change>();
        tokio::spawn(self.clone().apply_changes(changes_rx, outbound.clone(), fatal_tx));

        loop {
            tokio::select! {
                Some(error) = fatal_rx.recv() => return Err(error),

                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            tracing::warn!("Coordinator closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to read from coordinator: {}", e);
                            break;
                        }
                    };

                    let message = decode(&line)
                        .context("received an invalid command from the coordinator")?;
                    if message.command == Command::Heartbeat {
                        tracing::trace!("Worker [{}] received heartbeat", self.id);
                    } else {
                        tracing::debug!("Worker [{}] received: {}", self.id, line);
                    }

                    if self.dispatch(message, &outbound, &changes)?.is_break() {
                        return Ok(Shutdown::Exit);
                    }
                }
            }
        }

        let _ = outbound.send(Message::with_fields(Command::Exit, [self.id.to_string()]));
        drop(outbound);
        drop(changes);
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;

        Ok(Shutdown::Disconnected)
    }

    fn dispatch(
        &self,
        message: Message,
        outbound: &mpsc::UnboundedSender<Message>,
        changes: &mpsc::UnboundedSender<Change>,
    ) -> Result<ControlFlow<()>> {
        match message.command {
            Command::Heartbeat => {
                let _ = outbound.send(Message::new(Command::Alive));
            }
            Command::Search => {
                let query = message.field(0)?.to_string();
                let client_id = message.field(1)?.to_string();
                let epoch = self.state.begin_search();
                let queued = changes.send(Change::Search {
                    query,
                    client_id,
                    epoch,
                });
                if queued.is_err() {
                    self.state.finish_search();
                }
            }
            Command::Load => {
                let _ = changes.send(Change::Load(message.names()));
            }
            Command::Unload => {
                let _ = changes.send(Change::Unload(message.names()));
            }
            Command::Abort => {
                tracing::info!("Abort command received from coordinator");
                self.state.abort();
            }
            Command::Exit => {
                tracing::info!("Worker [{}] is now exiting", self.id);
                return Ok(ControlFlow::Break(()));
            }
            other => bail!("unexpected {} command from the coordinator", other),
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Applies queued changes one at a time until the command loop goes away.
    /// A failed load is fatal and stops the queue.
    async fn apply_changes(
        self,
        mut queue: mpsc::UnboundedReceiver<Change>,
        outbound: mpsc::UnboundedSender<Message>,
        fatal: mpsc::UnboundedSender<anyhow::Error>,
    ) {
        while let Some(change) = queue.recv().await {
            match change {
                Change::Load(names) => {
                    tracing::info!("Loading chunks into memory: {:?}", names);
                    match self.state.load(&self.chunk_dir, &names).await {
                        Ok(resident) => {
                            let _ = outbound.send(Message::memory_files(&resident));
                        }
                        Err(error) => {
                            let _ = fatal.send(error);
                            return;
                        }
                    }
                }
                Change::Unload(names) => {
                    tracing::info!("Unloading chunks from memory: {:?}", names);
                    let resident = self.state.unload(&names).await;
                    let _ = outbound.send(Message::memory_files(&resident));
                }
                Change::Search {
                    query,
                    client_id,
                    epoch,
                } => {
                    let chunks = self.state.dataset.read().await.snapshot();
                    self.spawn_search(query, client_id, epoch, chunks, outbound.clone());
                }
            }
        }
    }

    fn spawn_search(
        &self,
        query: String,
        client_id: String,
        epoch: u64,
        chunks: Vec<Arc<Chunk>>,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        let state = self.state.clone();

        tokio::spawn(async move {
            tracing::info!("Worker is now searching query [{}]", query);

            let outcome = {
                let state = state.clone();
                let query = query.clone();
                tokio::task::spawn_blocking(move || {
                    scan(&chunks, &query, || state.is_aborted(epoch))
                })
                .await
            };
            state.finish_search();

            match outcome {
                Ok(ScanOutcome::Found { chunk, line }) => {
                    tracing::info!("[{}] found in chunk [{}] at line {}", query, chunk, line);
                    let _ = outbound.send(Message::found(&query, &client_id));
                }
                Ok(ScanOutcome::NotFound) => {
                    tracing::info!("[{}] not found", query);
                    let _ = outbound.send(Message::not_found(&query, &client_id));
                }
                Ok(ScanOutcome::Aborted) => {
                    tracing::info!("Search for [{}] terminated by abort command", query);
                }
                Err(e) => {
                    tracing::error!("Search task for [{}] failed: {}", query, e);
                }
            }
        });
    }
}
