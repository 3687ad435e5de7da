//! Connection Sessions
//!
//! One task set per worker connection:
//! - the handshake (id line, OKY/DUP, chunk listing),
//! - a reader forwarding every decoded line to the registry,
//! - a writer draining the worker's outbound queue,
//! - a heartbeat loop probing the worker once it is admitted.
//!
//! Search clients on the TCP listener get a much simpler session: one query
//! line in, one result line out.

use super::registry::ClusterHandle;
use super::types::{HeartbeatReply, JoinDecision, LeaveCause, SessionId, WorkerHandle, WorkerId};
use crate::config::ClusterTimings;
use crate::wire::{Command, Message, decode, encode, split_names, write_messages};

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeSet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accepts worker connections forever. Only an accept failure returns.
pub async fn serve_workers(
    listener: TcpListener,
    cluster: ClusterHandle,
    timings: ClusterTimings,
) -> Result<()> {
    tracing::info!("Listening for nodes on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .context("failed to accept node connection")?;
        tracing::info!("New node connection from {}", addr);

        let cluster = cluster.clone();
        let timings = timings.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_worker(stream, cluster, timings).await {
                tracing::warn!("Node session from {} ended: {:#}", addr, e);
            }
        });
    }
}

/// Accepts search clients forever. Only an accept failure returns.
pub async fn serve_clients(listener: TcpListener, cluster: ClusterHandle) -> Result<()> {
    tracing::info!("Listening for clients on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .context("failed to accept client connection")?;
        tracing::debug!("New client connection from {}", addr);

        let cluster = cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, cluster).await {
                tracing::warn!("Client session from {} failed: {:#}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, cluster: ClusterHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(query) = lines.next_line().await? else {
        return Ok(());
    };
    let outcome = cluster.search(query).await?;

    writer.write_all(encode(&outcome.to_message()).as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn handle_worker(stream: TcpStream, cluster: ClusterHandle, timings: ClusterTimings) -> Result<()> {
    let addr = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let id_line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("connection closed before the node sent its id"))?;
    let id: WorkerId = id_line
        .parse()
        .with_context(|| format!("invalid node id {:?}", id_line))?;
    let session = SessionId::new();

    match cluster.claim(id, session).await? {
        JoinDecision::Duplicate => {
            writer
                .write_all(encode(&Message::new(Command::Duplicate)).as_bytes())
                .await?;
            return Ok(());
        }
        JoinDecision::Accepted => {
            let reply = writer.write_all(encode(&Message::new(Command::Okay)).as_bytes()).await;
            if let Err(e) = reply {
                cluster.leave(id, session, LeaveCause::ConnectionLost);
                return Err(e.into());
            }
        }
    }

    let listing = match lines.next_line().await {
        Ok(Some(listing)) => listing,
        Ok(None) => {
            cluster.leave(id, session, LeaveCause::ConnectionLost);
            return Err(anyhow!("node [{}] closed the connection during handshake", id));
        }
        Err(e) => {
            cluster.leave(id, session, LeaveCause::ConnectionLost);
            return Err(e.into());
        }
    };
    let chunk_files: BTreeSet<String> = split_names(&listing).into_iter().collect();

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (heartbeat, heartbeat_rx) = mpsc::channel(1);
    let probe = outbound.downgrade();

    tokio::spawn(async move {
        if let Err(e) = write_messages(writer, outbound_rx).await {
            tracing::warn!("Failed to write to node [{}]: {}", id, e);
        }
    });

    let admitted = cluster.join(WorkerHandle {
        id,
        session,
        addr,
        outbound,
        heartbeat,
        chunk_files,
        memory_files: BTreeSet::new(),
    })?;
    tokio::spawn(read_loop(id, session, lines, cluster.clone()));

    if admitted.await.is_err() {
        tracing::warn!("Node [{}] was not admitted", id);
        return Ok(());
    }

    heartbeat_loop(id, session, probe, heartbeat_rx, cluster, timings).await;
    Ok(())
}

async fn read_loop(
    id: WorkerId,
    session: SessionId,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    cluster: ClusterHandle,
) {
    let cause = loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode(&line) {
                Ok(message) => {
                    if message.command != Command::Alive {
                        tracing::debug!("Node [{}] sent: {}", id, line);
                    }
                    if !cluster.deliver(id, session, message) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Node [{}] sent an invalid message: {}", id, e);
                    break LeaveCause::ProtocolError;
                }
            },
            Ok(None) => break LeaveCause::ConnectionLost,
            Err(e) => {
                tracing::warn!("Failed to read from node [{}]: {}", id, e);
                break LeaveCause::ConnectionLost;
            }
        }
    };
    cluster.leave(id, session, cause);
}

/// Probes the worker every `heartbeat_interval` until it fails to answer ALV
/// within `heartbeat_timeout` or the registry drops it.
async fn heartbeat_loop(
    id: WorkerId,
    session: SessionId,
    outbound: mpsc::WeakUnboundedSender<Message>,
    mut replies: mpsc::Receiver<HeartbeatReply>,
    cluster: ClusterHandle,
    timings: ClusterTimings,
) {
    let mut interval = tokio::time::interval(timings.heartbeat_interval);
    interval.tick().await;

    loop {
        interval.tick().await;

        while replies.try_recv().is_ok() {}

        let Some(sender) = outbound.upgrade() else {
            return;
        };
        if sender.send(Message::new(Command::Heartbeat)).is_err() {
            return;
        }
        drop(sender);

        let verdict = match tokio::time::timeout(timings.heartbeat_timeout, replies.recv()).await {
            Ok(Some(HeartbeatReply::Alive)) => {
                tracing::trace!("Node [{}] is alive", id);
                continue;
            }
            Ok(Some(HeartbeatReply::NotAlive)) => "answered NAL",
            Ok(None) => return,
            Err(_) => "did not answer the heartbeat",
        };

        tracing::warn!("Node [{}] {}, removing it", id, verdict);
        if let Some(sender) = outbound.upgrade() {
            let _ = sender.send(Message::new(Command::Exit));
        }
        cluster.leave(id, session, LeaveCause::HeartbeatTimeout);
        return;
    }
}
