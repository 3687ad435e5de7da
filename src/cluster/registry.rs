//! Registry Event Loop
//!
//! Owns the worker table and the pending-search table. Every mutation of
//! either happens here, one event at a time, so there is no locking and no
//! check-then-act window between sessions.

use super::protocol::NodeSummary;
use super::types::{
    ClientId, ClientRequest, HeartbeatReply, JoinDecision, LeaveCause, RegistryEvent,
    SearchOutcome, SessionId, WorkerHandle, WorkerId,
};
use crate::config::ClusterTimings;
use crate::wire::{Command, Message};

use anyhow::{Result, anyhow};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};

/// Cheap, cloneable entry point to the registry task.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ClusterHandle {
    fn post(&self, event: RegistryEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!("cluster registry is not running"))
    }

    /// Starts a search and returns the stream its result arrives on: one
    /// FND/NFD line followed by EXT.
    pub fn submit(&self, query: impl Into<String>) -> Result<mpsc::UnboundedReceiver<Message>> {
        let (reply, results) = mpsc::unbounded_channel();
        self.post(RegistryEvent::Search {
            query: query.into(),
            reply,
        })?;
        Ok(results)
    }

    /// Runs a search to completion, consuming the terminal EXT marker.
    pub async fn search(&self, query: impl Into<String>) -> Result<SearchOutcome> {
        let mut results = self.submit(query)?;

        let first = results
            .recv()
            .await
            .ok_or_else(|| anyhow!("search was dropped before it completed"))?;
        let outcome = SearchOutcome::from_message(&first)
            .ok_or_else(|| anyhow!("unexpected search result {}", first))?;

        while let Some(message) = results.recv().await {
            if message.command == Command::Exit {
                break;
            }
        }
        Ok(outcome)
    }

    /// Connected workers sorted by id.
    pub async fn nodes(&self) -> Result<Vec<NodeSummary>> {
        let (reply, summary) = oneshot::channel();
        self.post(RegistryEvent::Snapshot { reply })?;
        Ok(summary.await?)
    }

    pub async fn claim(&self, id: WorkerId, session: SessionId) -> Result<JoinDecision> {
        let (reply, decision) = oneshot::channel();
        self.post(RegistryEvent::Claim { id, session, reply })?;
        Ok(decision.await?)
    }

    /// Hands a handshaken worker to the registry. The returned receiver
    /// resolves once placement is done and the worker is in the table; it
    /// errors if the registry refused the handle.
    pub fn join(&self, handle: WorkerHandle) -> Result<oneshot::Receiver<()>> {
        let (admitted, done) = oneshot::channel();
        self.post(RegistryEvent::Joined { handle, admitted })?;
        Ok(done)
    }

    /// Forwards a message read from a worker. False once the registry is gone.
    pub fn deliver(&self, worker: WorkerId, session: SessionId, message: Message) -> bool {
        self.post(RegistryEvent::Inbound {
            worker,
            session,
            message,
        })
        .is_ok()
    }

    pub fn leave(&self, worker: WorkerId, session: SessionId, cause: LeaveCause) {
        let _ = self.post(RegistryEvent::Left {
            worker,
            session,
            cause,
        });
    }
}

pub struct Registry {
    pub(crate) events: mpsc::UnboundedReceiver<RegistryEvent>,
    /// Events set aside while a joining worker was being placed, replayed in order.
    pub(crate) deferred: VecDeque<RegistryEvent>,
    /// Used by timers; does not keep the registry alive on its own.
    pub(crate) loopback: mpsc::WeakUnboundedSender<RegistryEvent>,
    pub(crate) timings: ClusterTimings,
    pub(crate) workers: HashMap<WorkerId, WorkerHandle>,
    /// Ids reserved by a handshake that has not finished yet.
    pub(crate) joining: HashMap<WorkerId, SessionId>,
    pub(crate) clients: HashMap<ClientId, ClientRequest>,
}

impl Registry {
    pub fn new(timings: ClusterTimings) -> (Self, ClusterHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let registry = Self {
            events,
            deferred: VecDeque::new(),
            loopback: events_tx.downgrade(),
            timings,
            workers: HashMap::new(),
            joining: HashMap::new(),
            clients: HashMap::new(),
        };
        (registry, ClusterHandle { events: events_tx })
    }

    /// Starts the registry on its own task. It stops once every handle is dropped.
    pub fn spawn(timings: ClusterTimings) -> ClusterHandle {
        let (registry, handle) = Self::new(timings);
        tokio::spawn(registry.run());
        handle
    }

    pub async fn run(mut self) {
        tracing::info!("Cluster registry started");
        while let Some(event) = self.next_event().await {
            self.handle_event(event).await;
        }
        tracing::info!("Cluster registry stopped");
    }

    async fn next_event(&mut self) -> Option<RegistryEvent> {
        match self.deferred.pop_front() {
            Some(event) => Some(event),
            None => self.events.recv().await,
        }
    }

    pub(crate) async fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Claim { id, session, reply } => {
                let decision = self.claim(id, session);
                let _ = reply.send(decision);
            }
            RegistryEvent::Joined { handle, admitted } => {
                self.admit(handle, admitted).await;
            }
            RegistryEvent::Inbound {
                worker,
                session,
                message,
            } => {
                if self.is_current(worker, session) {
                    self.dispatch(worker, session, message);
                } else {
                    tracing::debug!("Dropping {} from stale session of node [{}]", message, worker);
                }
            }
            RegistryEvent::Left {
                worker,
                session,
                cause,
            } => {
                if self.joining.get(&worker) == Some(&session) {
                    self.joining.remove(&worker);
                    tracing::warn!("Node [{}] left before joining ({})", worker, cause);
                }
                if self.is_current(worker, session) {
                    self.remove_worker(worker, cause);
                }
            }
            RegistryEvent::Search { query, reply } => self.submit_search(query, reply),
            RegistryEvent::SearchExpired { client } => self.expire_search(&client),
            RegistryEvent::Snapshot { reply } => {
                let _ = reply.send(self.summaries());
            }
        }
    }

    fn claim(&mut self, id: WorkerId, session: SessionId) -> JoinDecision {
        if self.workers.contains_key(&id) || self.joining.contains_key(&id) {
            tracing::warn!("Node [{}] is already present, rejecting duplicate", id);
            return JoinDecision::Duplicate;
        }
        self.joining.insert(id, session);
        JoinDecision::Accepted
    }

    async fn admit(&mut self, mut handle: WorkerHandle, admitted: oneshot::Sender<()>) {
        if self.joining.get(&handle.id) != Some(&handle.session) {
            tracing::warn!("Node [{}] lost its reservation before joining", handle.id);
            return;
        }

        tracing::info!(
            "Node [{}] offers {} chunk files: {:?}",
            handle.id,
            handle.chunk_files.len(),
            handle.chunk_files
        );
        self.place_joining(&mut handle).await;

        self.joining.remove(&handle.id);
        match handle.addr {
            Some(addr) => tracing::info!("New node [{}] connected from {}", handle.id, addr),
            None => tracing::info!("New node [{}] connected", handle.id),
        }
        self.workers.insert(handle.id, handle);
        let _ = admitted.send(());
    }

    pub(crate) fn is_current(&self, worker: WorkerId, session: SessionId) -> bool {
        self.workers
            .get(&worker)
            .is_some_and(|handle| handle.session == session)
    }

    fn dispatch(&mut self, worker: WorkerId, session: SessionId, message: Message) {
        match message.command {
            Command::Found => self.on_found(worker, &message),
            Command::NotFound => self.on_not_found(worker, &message),
            Command::Alive | Command::NotAlive => {
                self.route_heartbeat(worker, session, message.command)
            }
            Command::MemoryFiles => {
                if let Some(handle) = self.workers.get_mut(&worker) {
                    handle.memory_files = message.names().into_iter().collect();
                    tracing::info!(
                        "Node [{}] memory files: {:?}",
                        worker,
                        handle.memory_files
                    );
                }
            }
            Command::AbortAck => {
                tracing::info!("Node [{}] acknowledged abort", worker);
            }
            Command::Exit => self.remove_worker(worker, LeaveCause::Exit),
            other => {
                tracing::warn!("Ignoring unexpected {} from node [{}]", other, worker);
            }
        }
    }

    /// Hands an ALV/NAL to the session's heartbeat task without waiting on it.
    pub(crate) fn route_heartbeat(&self, worker: WorkerId, session: SessionId, command: Command) {
        let Some(handle) = self.workers.get(&worker).filter(|h| h.session == session) else {
            return;
        };
        let reply = if command == Command::Alive {
            HeartbeatReply::Alive
        } else {
            HeartbeatReply::NotAlive
        };
        if handle.heartbeat.try_send(reply).is_err() {
            tracing::debug!("Dropping unsolicited {} from node [{}]", command, worker);
        }
    }

    /// Removes a worker and reassigns what only it had in memory.
    pub(crate) fn remove_worker(&mut self, id: WorkerId, cause: LeaveCause) {
        let Some(handle) = self.workers.remove(&id) else {
            return;
        };
        match handle.addr {
            Some(addr) => tracing::info!("Node [{}] at {} is disconnected ({})", id, addr, cause),
            None => tracing::info!("Node [{}] is disconnected ({})", id, cause),
        }
        self.recover_chunks(&handle);
    }

    fn summaries(&self) -> Vec<NodeSummary> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.workers.get(id))
            .map(WorkerHandle::summary)
            .collect()
    }
}
