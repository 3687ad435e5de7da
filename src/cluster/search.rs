//! Search Fan-out
//!
//! A query goes to every connected worker tagged with a fresh client id. The
//! first FND decides the result and every other worker gets ABT; otherwise
//! the request waits until all workers it was sent to have answered NFD.
//! Requests also expire after `search_timeout` so a worker that dies
//! mid-search cannot leave a client hanging.

use super::registry::Registry;
use super::types::{ClientId, ClientRequest, RegistryEvent, SearchOutcome, WorkerId};
use crate::wire::{Command, Message};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl Registry {
    pub(crate) fn submit_search(&mut self, query: String, reply: mpsc::UnboundedSender<Message>) {
        tracing::info!("Client request to search: [{}]", query);

        if self.workers.is_empty() {
            tracing::info!("No nodes connected, [{}] not found", query);
            finish(&reply, SearchOutcome::NotFound);
            return;
        }

        let client = self.fresh_client_id();
        let message = Message::search(&query, &client.0);
        let mut targets: Vec<WorkerId> = self.workers.keys().copied().collect();
        targets.sort();

        let expiry = self.schedule_expiry(client.clone()).abort_handle();
        self.clients.insert(
            client.clone(),
            ClientRequest {
                id: client,
                query: query.clone(),
                reply,
                not_found: 0,
                expected: targets.len(),
                expiry,
            },
        );

        for worker in &targets {
            if let Some(handle) = self.workers.get(worker) {
                tracing::info!("Sending search query [{}] to node [{}]", query, worker);
                handle.send(message.clone());
            }
        }
    }

    pub(crate) fn on_found(&mut self, worker: WorkerId, message: &Message) {
        let Ok(client) = message.field(1) else {
            tracing::warn!("Node [{}] sent {} without a client id", worker, message);
            return;
        };
        let Some(request) = self.clients.remove(&ClientId(client.to_string())) else {
            tracing::debug!("Late FND from node [{}] for finished request [{}]", worker, client);
            return;
        };

        tracing::info!("[{}] found by node [{}]", request.query, worker);
        for (id, handle) in &self.workers {
            if *id != worker {
                handle.send(Message::new(Command::Abort));
            }
        }
        request.complete(SearchOutcome::Found(worker));
    }

    pub(crate) fn on_not_found(&mut self, worker: WorkerId, message: &Message) {
        let Ok(client) = message.field(1) else {
            tracing::warn!("Node [{}] sent {} without a client id", worker, message);
            return;
        };
        let client = ClientId(client.to_string());
        let Some(request) = self.clients.get_mut(&client) else {
            tracing::debug!("Late NFD from node [{}] for finished request [{}]", worker, client);
            return;
        };

        request.not_found += 1;
        tracing::debug!(
            "[{}] not found by node [{}] ({}/{})",
            request.query,
            worker,
            request.not_found,
            request.expected
        );
        if request.not_found >= request.expected {
            if let Some(request) = self.clients.remove(&client) {
                tracing::info!("[{}] not found on any node", request.query);
                request.complete(SearchOutcome::NotFound);
            }
        }
    }

    pub(crate) fn expire_search(&mut self, client: &ClientId) {
        if let Some(request) = self.clients.remove(client) {
            tracing::warn!(
                "Search [{}] of request [{}] timed out with {}/{} answers",
                request.query,
                request.id,
                request.not_found,
                request.expected
            );
            finish(&request.reply, SearchOutcome::NotFound);
        }
    }

    fn fresh_client_id(&self) -> ClientId {
        loop {
            let id = ClientId::new();
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// Posts `SearchExpired` for `client` after `search_timeout`.
    pub(crate) fn schedule_expiry(&self, client: ClientId) -> JoinHandle<()> {
        let loopback = self.loopback.clone();
        let timeout = self.timings.search_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(events) = loopback.upgrade() {
                let _ = events.send(RegistryEvent::SearchExpired { client });
            }
        })
    }
}

/// Sends the result line and the terminal EXT to whoever asked.
fn finish(reply: &mpsc::UnboundedSender<Message>, outcome: SearchOutcome) {
    let _ = reply.send(outcome.to_message());
    let _ = reply.send(Message::new(Command::Exit));
}

impl ClientRequest {
    /// Stops the expiry timer and answers the client.
    fn complete(self, outcome: SearchOutcome) {
        self.expiry.abort();
        finish(&self.reply, outcome);
    }
}
