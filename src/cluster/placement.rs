//! Chunk Placement
//!
//! Decides which worker keeps which chunk in memory. The goal is that every
//! chunk available on some worker's disk is resident on exactly one worker.
//!
//! - On join, chunks nobody holds are loaded by the newcomer. If there are
//!   none, the newcomer takes over part of the memory of workers that hold
//!   more than twice what it holds.
//!   A donor only unloads once the newcomer has reported the chunks resident,
//!   so a newcomer that fails mid-transfer leaves the donor untouched.
//! - On loss, every chunk that was only resident on the lost worker is loaded
//!   by the first surviving worker (lowest id) that has it on disk.
//!
//! The planning functions are pure; the `Registry` methods below apply them
//! and talk to workers.

use super::registry::Registry;
use super::types::{RegistryEvent, WorkerHandle, WorkerId};
use crate::wire::{Command, Message};

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Chunks moved from one donor to the joining worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub donor: WorkerId,
    pub chunks: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// LOD batches per surviving worker.
    pub loads: BTreeMap<WorkerId, Vec<String>>,
    /// Chunks no surviving worker has on disk.
    pub lost: Vec<String>,
}

/// Offered chunks that are resident on none of `workers`, in name order.
pub fn absent_chunks<'a>(
    offered: &BTreeSet<String>,
    workers: impl IntoIterator<Item = &'a WorkerHandle>,
) -> Vec<String> {
    let resident: BTreeSet<&String> = workers
        .into_iter()
        .flat_map(|handle| handle.memory_files.iter())
        .collect();

    offered
        .iter()
        .filter(|chunk| !resident.contains(chunk))
        .cloned()
        .collect()
}

/// What `donor` should hand over to a joining worker, if anything.
///
/// The donor qualifies when it holds more than twice as many chunks as the
/// joiner and some of them are on the joiner's disk. It gives
/// `resident / shared` of the shared chunks, at least one and at most all of
/// them, lowest names first.
pub fn transfer_from(
    joining_files: &BTreeSet<String>,
    joining_resident: usize,
    donor: &WorkerHandle,
) -> Option<Transfer> {
    let donor_resident = donor.memory_files.len();
    if donor_resident <= 2 * joining_resident {
        return None;
    }

    let shared: Vec<&String> = donor.memory_files.intersection(joining_files).collect();
    if shared.is_empty() {
        return None;
    }

    let count = if shared.len() == 1 {
        1
    } else {
        (donor_resident / shared.len()).clamp(1, shared.len())
    };

    Some(Transfer {
        donor: donor.id,
        chunks: shared.into_iter().take(count).cloned().collect(),
    })
}

/// Reassigns the chunks a lost worker held in memory.
pub fn plan_recovery(
    lost_resident: &BTreeSet<String>,
    survivors: &HashMap<WorkerId, WorkerHandle>,
) -> RecoveryPlan {
    let mut order: Vec<&WorkerHandle> = survivors.values().collect();
    order.sort_by_key(|handle| handle.id);

    let mut plan = RecoveryPlan::default();
    for chunk in lost_resident {
        if order.iter().any(|handle| handle.memory_files.contains(chunk)) {
            continue;
        }
        match order.iter().find(|handle| handle.chunk_files.contains(chunk)) {
            Some(target) => plan.loads.entry(target.id).or_default().push(chunk.clone()),
            None => plan.lost.push(chunk.clone()),
        }
    }
    plan
}

impl Registry {
    /// Runs join-time placement for a worker that is not yet in the table.
    pub(crate) async fn place_joining(&mut self, handle: &mut WorkerHandle) {
        let absent = absent_chunks(&handle.chunk_files, self.workers.values());
        if !absent.is_empty() {
            tracing::info!(
                "Node [{}] loads {} chunks no other node holds",
                handle.id,
                absent.len()
            );
            if handle.send(Message::load(&absent)) {
                self.await_memory_report(handle).await;
            }
            return;
        }

        let mut donors: Vec<WorkerId> = self.workers.keys().copied().collect();
        donors.sort();

        for donor_id in donors {
            let Some(donor) = self.workers.get(&donor_id) else {
                continue;
            };
            let Some(transfer) =
                transfer_from(&handle.chunk_files, handle.memory_files.len(), donor)
            else {
                continue;
            };

            tracing::info!(
                "Moving {:?} from node [{}] to node [{}]",
                transfer.chunks,
                donor_id,
                handle.id
            );
            if !handle.send(Message::load(&transfer.chunks)) {
                break;
            }
            if !self.await_memory_report(handle).await {
                tracing::warn!(
                    "Node [{}] keeps {:?}, the transfer was not confirmed",
                    donor_id,
                    transfer.chunks
                );
                break;
            }

            let moved: Vec<String> = transfer
                .chunks
                .into_iter()
                .filter(|chunk| handle.memory_files.contains(chunk))
                .collect();
            if moved.is_empty() {
                continue;
            }
            if let Some(donor) = self.workers.get_mut(&donor_id) {
                donor.send(Message::unload(&moved));
                for chunk in &moved {
                    donor.memory_files.remove(chunk);
                }
            }
        }
    }

    /// Waits for the joining worker's MMF without stalling the rest of the
    /// cluster: heartbeat replies are still routed, everything else is queued
    /// for after the join. Returns false on timeout or if the worker left.
    async fn await_memory_report(&mut self, handle: &mut WorkerHandle) -> bool {
        let deadline = tokio::time::sleep(self.timings.placement_timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("Node [{}] did not report its memory files in time", handle.id);
                    return false;
                }
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                return false;
            };

            match event {
                RegistryEvent::Inbound {
                    worker,
                    session,
                    message,
                } if worker == handle.id && session == handle.session => {
                    if message.command == Command::MemoryFiles {
                        handle.memory_files = message.names().into_iter().collect();
                        tracing::info!(
                            "Node [{}] memory files: {:?}",
                            handle.id,
                            handle.memory_files
                        );
                        return true;
                    }
                    tracing::debug!("Ignoring {} from joining node [{}]", message, worker);
                }
                RegistryEvent::Left {
                    worker,
                    session,
                    cause,
                } if worker == handle.id && session == handle.session => {
                    tracing::warn!("Node [{}] left while joining ({})", worker, cause);
                    self.deferred.push_back(RegistryEvent::Left {
                        worker,
                        session,
                        cause,
                    });
                    return false;
                }
                RegistryEvent::Inbound {
                    worker,
                    session,
                    message,
                } if matches!(message.command, Command::Alive | Command::NotAlive) => {
                    self.route_heartbeat(worker, session, message.command);
                }
                other => self.deferred.push_back(other),
            }
        }
    }

    /// Loads whatever only `lost` had in memory onto surviving workers.
    pub(crate) fn recover_chunks(&mut self, lost: &WorkerHandle) {
        let plan = plan_recovery(&lost.memory_files, &self.workers);

        for (target, chunks) in plan.loads {
            if let Some(handle) = self.workers.get_mut(&target) {
                tracing::info!(
                    "Node [{}] takes over {:?} from node [{}]",
                    target,
                    chunks,
                    lost.id
                );
                handle.send(Message::load(&chunks));
                handle.memory_files.extend(chunks);
            }
        }
        for chunk in plan.lost {
            tracing::error!(
                "Chunk [{}] was lost with node [{}] and no other node has it on disk",
                chunk,
                lost.id
            );
        }
    }
}
