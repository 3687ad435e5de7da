//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **Placement planning**: absent chunks, donor selection and shift sizes, loss recovery plans.
//! - **Registry**: joins, duplicates, stale sessions, memory reports, heartbeat routing.
//! - **Search**: early FOUND with abort, NOT FOUND only after every worker answered, expiry.
//! - **End to end**: real worker agents over TCP, the HTTP API and the TCP client listener.

#[cfg(test)]
mod tests {
    use crate::cluster::handlers::router;
    use crate::cluster::placement::{Transfer, absent_chunks, plan_recovery, transfer_from};
    use crate::cluster::protocol::SearchResponse;
    use crate::cluster::registry::{ClusterHandle, Registry};
    use crate::cluster::session::{serve_clients, serve_workers};
    use crate::cluster::types::{
        ClientId, ClientRequest, HeartbeatReply, JoinDecision, LeaveCause, RegistryEvent, SearchOutcome, SessionId,
        WorkerHandle, WorkerId,
    };
    use crate::config::ClusterTimings;
    use crate::wire::{Command, Message};
    use crate::worker::WorkerAgent;

    use std::collections::{BTreeSet, HashMap};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn timings() -> ClusterTimings {
        ClusterTimings {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(50),
            search_timeout: Duration::from_secs(5),
            placement_timeout: Duration::from_secs(5),
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    /// A worker handle wired to channels the test reads directly.
    fn handle(
        id: u32,
        chunks: &[&str],
        memory: &[&str],
    ) -> (
        WorkerHandle,
        mpsc::UnboundedReceiver<Message>,
        mpsc::Receiver<HeartbeatReply>,
    ) {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let (heartbeat, heartbeat_rx) = mpsc::channel(1);
        let handle = WorkerHandle {
            id: WorkerId(id),
            session: SessionId::new(),
            addr: None,
            outbound,
            heartbeat,
            chunk_files: names(chunks),
            memory_files: names(memory),
        };
        (handle, inbox, heartbeat_rx)
    }

    async fn recv(inbox: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    struct FakeWorker {
        id: WorkerId,
        session: SessionId,
        inbox: mpsc::UnboundedReceiver<Message>,
        heartbeat: mpsc::Receiver<HeartbeatReply>,
        /// Messages received while joining.
        during_join: Vec<Message>,
    }

    impl FakeWorker {
        async fn recv(&mut self) -> Message {
            recv(&mut self.inbox).await
        }

        fn reply(&self, cluster: &ClusterHandle, message: Message) {
            assert!(cluster.deliver(self.id, self.session, message));
        }
    }

    /// Joins a worker that answers every LOD the way a real one would.
    async fn join(cluster: &ClusterHandle, id: u32, chunks: &[&str]) -> FakeWorker {
        let (handle, mut inbox, heartbeat) = handle(id, chunks, &[]);
        let (id, session) = (handle.id, handle.session);

        assert_eq!(cluster.claim(id, session).await.unwrap(), JoinDecision::Accepted);
        let mut admitted = cluster.join(handle).unwrap();

        let mut resident = BTreeSet::new();
        let mut during_join = Vec::new();
        loop {
            tokio::select! {
                result = &mut admitted => {
                    result.expect("worker was not admitted");
                    break;
                }
                Some(message) = inbox.recv() => {
                    if message.command == Command::Load {
                        resident.extend(message.names());
                        let report: Vec<String> = resident.iter().cloned().collect();
                        assert!(cluster.deliver(id, session, Message::memory_files(&report)));
                    }
                    during_join.push(message);
                }
            }
        }

        FakeWorker {
            id,
            session,
            inbox,
            heartbeat,
            during_join,
        }
    }

    // ==========================================
    // Placement Planning
    // ==========================================

    #[test]
    fn test_absent_chunks_skips_resident_ones() {
        let (a, _, _) = handle(1, &["c1", "c2"], &["c1"]);
        let (b, _, _) = handle(2, &["c3"], &["c3"]);

        let absent = absent_chunks(&names(&["c1", "c2", "c3", "c4"]), [&a, &b]);

        assert_eq!(absent, vec!["c2".to_string(), "c4".to_string()]);
    }

    #[test]
    fn test_transfer_requires_donor_to_hold_twice_as_much() {
        let (donor, _, _) = handle(1, &["c1", "c2"], &["c1", "c2"]);

        assert_eq!(transfer_from(&names(&["c1", "c2"]), 1, &donor), None);
    }

    #[test]
    fn test_transfer_requires_shared_chunks() {
        let (donor, _, _) = handle(1, &["c1", "c2", "c3"], &["c1", "c2", "c3"]);

        assert_eq!(transfer_from(&names(&["c9"]), 0, &donor), None);
    }

    #[test]
    fn test_transfer_sizes() {
        let (four, _, _) = handle(1, &[], &["c1", "c2", "c3", "c4"]);

        // One shared chunk always moves.
        let single = transfer_from(&names(&["c3"]), 0, &four).unwrap();
        assert_eq!(single.chunks, vec!["c3".to_string()]);

        // 4 resident / 3 shared = 1.
        let one = transfer_from(&names(&["c1", "c2", "c3"]), 0, &four).unwrap();
        assert_eq!(one.chunks, vec!["c1".to_string()]);

        // 4 resident / 2 shared = 2.
        let two = transfer_from(&names(&["c2", "c4"]), 1, &four).unwrap();
        assert_eq!(
            two,
            Transfer {
                donor: WorkerId(1),
                chunks: vec!["c2".to_string(), "c4".to_string()],
            }
        );
    }

    #[test]
    fn test_transfer_is_clamped_to_shared_chunks() {
        let many: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
        let many: Vec<&str> = many.iter().map(String::as_str).collect();
        let (donor, _, _) = handle(1, &many, &many);

        let transfer = transfer_from(&names(&["c0", "c1"]), 0, &donor).unwrap();

        assert_eq!(transfer.chunks, vec!["c0".to_string(), "c1".to_string()]);
    }

    #[test]
    fn test_recovery_prefers_lowest_id_and_skips_resident_chunks() {
        let mut survivors = HashMap::new();
        for (id, chunks, memory) in [(3, &["x", "z"][..], &["z"][..]), (2, &["x", "y"][..], &[][..])]
        {
            let (h, _, _) = handle(id, chunks, memory);
            survivors.insert(h.id, h);
        }

        let plan = plan_recovery(&names(&["w", "x", "y", "z"]), &survivors);

        assert_eq!(
            plan.loads.get(&WorkerId(2)),
            Some(&vec!["x".to_string(), "y".to_string()])
        );
        assert!(!plan.loads.contains_key(&WorkerId(3)));
        assert_eq!(plan.lost, vec!["w".to_string()]);
    }

    // ==========================================
    // Registry
    // ==========================================

    #[tokio::test]
    async fn test_join_loads_absent_chunks() {
        let cluster = Registry::spawn(timings());

        let worker = join(&cluster, 1, &["c1", "c2"]).await;

        assert_eq!(worker.during_join.len(), 1);
        assert_eq!(worker.during_join[0].to_string(), "LOD*|*c1--c2");
        let nodes = cluster.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "1");
        assert_eq!(nodes[0].memory, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let cluster = Registry::spawn(timings());
        let _first = join(&cluster, 1, &["c1"]).await;

        let decision = cluster.claim(WorkerId(1), SessionId::new()).await.unwrap();
        assert_eq!(decision, JoinDecision::Duplicate);

        // A reservation blocks the id too.
        let pending = SessionId::new();
        assert_eq!(cluster.claim(WorkerId(2), pending).await.unwrap(), JoinDecision::Accepted);
        let decision = cluster.claim(WorkerId(2), SessionId::new()).await.unwrap();
        assert_eq!(decision, JoinDecision::Duplicate);

        // Releasing it frees the id again.
        cluster.leave(WorkerId(2), pending, LeaveCause::ConnectionLost);
        let decision = cluster.claim(WorkerId(2), SessionId::new()).await.unwrap();
        assert_eq!(decision, JoinDecision::Accepted);

        assert_eq!(cluster.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_join_rebalances_from_loaded_donor() {
        let cluster = Registry::spawn(timings());
        let mut a = join(&cluster, 1, &["c1", "c2", "c3", "c4"]).await;

        let b = join(&cluster, 2, &["c1", "c2"]).await;

        assert_eq!(a.recv().await.to_string(), "ULD*|*c1--c2");
        assert_eq!(b.during_join[0].to_string(), "LOD*|*c1--c2");

        let nodes = cluster.nodes().await.unwrap();
        assert_eq!(nodes[0].memory, vec!["c3".to_string(), "c4".to_string()]);
        assert_eq!(nodes[1].memory, vec!["c1".to_string(), "c2".to_string()]);
    }

    /// Starts joining `id` and returns once its first LOD arrived, without answering it.
    async fn begin_join(
        cluster: &ClusterHandle,
        id: u32,
        chunks: &[&str],
    ) -> (
        WorkerId,
        SessionId,
        tokio::sync::oneshot::Receiver<()>,
        mpsc::UnboundedReceiver<Message>,
        mpsc::Receiver<HeartbeatReply>,
    ) {
        let (joiner, mut inbox, heartbeat) = handle(id, chunks, &[]);
        let (id, session) = (joiner.id, joiner.session);
        assert_eq!(cluster.claim(id, session).await.unwrap(), JoinDecision::Accepted);
        let admitted = cluster.join(joiner).unwrap();
        assert_eq!(recv(&mut inbox).await.command, Command::Load);
        (id, session, admitted, inbox, heartbeat)
    }

    #[tokio::test]
    async fn test_donor_keeps_chunks_when_joiner_leaves_mid_transfer() {
        let cluster = Registry::spawn(timings());
        let mut a = join(&cluster, 1, &["c1", "c2", "c3", "c4"]).await;

        let (b_id, b_session, admitted, _b_inbox, _b_heartbeat) =
            begin_join(&cluster, 2, &["c1", "c2"]).await;
        assert!(a.inbox.try_recv().is_err());

        cluster.leave(b_id, b_session, LeaveCause::ConnectionLost);
        tokio::time::timeout(WAIT, admitted).await.unwrap().unwrap();

        let nodes = cluster.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].memory.len(), 4);
        assert!(a.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_donor_keeps_chunks_when_joiner_never_confirms() {
        let cluster = Registry::spawn(ClusterTimings {
            placement_timeout: Duration::from_millis(100),
            ..timings()
        });
        let mut a = join(&cluster, 1, &["c1", "c2", "c3", "c4"]).await;

        let (_, _, admitted, _b_inbox, _b_heartbeat) =
            begin_join(&cluster, 2, &["c1", "c2"]).await;
        tokio::time::timeout(WAIT, admitted).await.unwrap().unwrap();

        let nodes = cluster.nodes().await.unwrap();
        assert_eq!(
            nodes[0].memory,
            vec!["c1".to_string(), "c2".to_string(), "c3".to_string(), "c4".to_string()]
        );
        assert!(nodes[1].memory.is_empty());
        assert!(a.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_takes_over_single_shared_chunk() {
        let cluster = Registry::spawn(timings());
        let _a = join(&cluster, 1, &["c1"]).await;
        let mut b = join(&cluster, 2, &["c9"]).await;

        let c = join(&cluster, 3, &["c9"]).await;

        assert_eq!(b.recv().await.to_string(), "ULD*|*c9");
        assert_eq!(c.during_join[0].to_string(), "LOD*|*c9");
        let nodes = cluster.nodes().await.unwrap();
        assert!(nodes[1].memory.is_empty());
        assert_eq!(nodes[2].memory, vec!["c9".to_string()]);
    }

    #[tokio::test]
    async fn test_join_with_empty_listing_loads_nothing() {
        let cluster = Registry::spawn(timings());
        let _a = join(&cluster, 1, &["c1"]).await;

        let b = join(&cluster, 2, &[]).await;

        assert!(b.during_join.is_empty());
        assert_eq!(cluster.nodes().await.unwrap()[0].memory, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_placement_wait_keeps_heartbeats_flowing() {
        let cluster = Registry::spawn(timings());
        let mut a = join(&cluster, 1, &["c1"]).await;

        let (b, mut b_inbox, _b_heartbeat) = handle(2, &["c2"], &[]);
        let (b_id, b_session) = (b.id, b.session);
        assert_eq!(cluster.claim(b_id, b_session).await.unwrap(), JoinDecision::Accepted);
        let admitted = cluster.join(b).unwrap();
        assert_eq!(recv(&mut b_inbox).await.to_string(), "LOD*|*c2");

        // The registry is waiting for B's memory report.
        let mut results = cluster.submit("needle").unwrap();
        a.reply(&cluster, Message::new(Command::Alive));

        let beat = tokio::time::timeout(WAIT, a.heartbeat.recv()).await.unwrap();
        assert_eq!(beat, Some(HeartbeatReply::Alive));
        assert!(results.try_recv().is_err());
        assert!(a.inbox.try_recv().is_err());

        assert!(cluster.deliver(b_id, b_session, Message::memory_files(&["c2"])));
        tokio::time::timeout(WAIT, admitted).await.unwrap().unwrap();

        // The deferred search now reaches both workers.
        assert_eq!(a.recv().await.command, Command::Search);
        assert_eq!(recv(&mut b_inbox).await.command, Command::Search);
    }

    #[tokio::test]
    async fn test_loss_recovery_loads_chunks_on_survivor() {
        let (mut registry, _cluster) = Registry::new(timings());
        let (a, _a_inbox, _) = handle(1, &["x", "y"], &["x", "y"]);
        let (b, mut b_inbox, _) = handle(2, &["x", "y"], &[]);
        let a_session = a.session;
        registry.workers.insert(a.id, a);
        registry.workers.insert(b.id, b);

        registry
            .handle_event(RegistryEvent::Left {
                worker: WorkerId(1),
                session: a_session,
                cause: LeaveCause::ConnectionLost,
            })
            .await;

        assert_eq!(b_inbox.try_recv().unwrap().to_string(), "LOD*|*x--y");
        assert!(!registry.workers.contains_key(&WorkerId(1)));
        assert_eq!(registry.workers[&WorkerId(2)].memory_files, names(&["x", "y"]));
    }

    #[tokio::test]
    async fn test_stale_session_cannot_remove_worker() {
        let (mut registry, _cluster) = Registry::new(timings());
        let (a, _a_inbox, _) = handle(1, &["x"], &["x"]);
        registry.workers.insert(a.id, a);

        registry
            .handle_event(RegistryEvent::Left {
                worker: WorkerId(1),
                session: SessionId::new(),
                cause: LeaveCause::ConnectionLost,
            })
            .await;

        assert!(registry.workers.contains_key(&WorkerId(1)));
    }

    #[tokio::test]
    async fn test_inbound_memory_report_and_exit() {
        let (mut registry, _cluster) = Registry::new(timings());
        let (a, _a_inbox, _) = handle(1, &["x", "y"], &["x"]);
        let session = a.session;
        registry.workers.insert(a.id, a);

        registry
            .handle_event(RegistryEvent::Inbound {
                worker: WorkerId(1),
                session,
                message: Message::memory_files(&["x", "y"]),
            })
            .await;
        assert_eq!(registry.workers[&WorkerId(1)].memory_files, names(&["x", "y"]));

        registry
            .handle_event(RegistryEvent::Inbound {
                worker: WorkerId(1),
                session,
                message: Message::with_fields(Command::Exit, ["1"]),
            })
            .await;
        assert!(registry.workers.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_replies_are_routed_without_blocking() {
        let (mut registry, _cluster) = Registry::new(timings());
        let (a, _a_inbox, mut heartbeat) = handle(1, &["x"], &["x"]);
        let session = a.session;
        registry.workers.insert(a.id, a);

        for command in [Command::Alive, Command::NotAlive] {
            registry
                .handle_event(RegistryEvent::Inbound {
                    worker: WorkerId(1),
                    session,
                    message: Message::new(command),
                })
                .await;
        }

        // Capacity one: the second reply was dropped, not queued.
        assert_eq!(heartbeat.try_recv().unwrap(), HeartbeatReply::Alive);
        assert!(heartbeat.try_recv().is_err());
    }

    // ==========================================
    // Search
    // ==========================================

    #[tokio::test]
    async fn test_search_without_workers_is_not_found() {
        let cluster = Registry::spawn(timings());

        let outcome = cluster.search("needle").await.unwrap();

        assert_eq!(outcome, SearchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_found_aborts_other_workers() {
        let cluster = Registry::spawn(timings());
        let mut w1 = join(&cluster, 1, &["c1"]).await;
        let mut w2 = join(&cluster, 2, &["c2"]).await;

        let mut results = cluster.submit("needle").unwrap();
        let srh1 = w1.recv().await;
        let srh2 = w2.recv().await;
        assert_eq!(srh1.command, Command::Search);
        assert_eq!(srh1.field(0).unwrap(), "needle");
        assert_eq!(srh1.field(1).unwrap().len(), 13);
        assert_eq!(srh1, srh2);

        let client = srh1.field(1).unwrap().to_string();
        w1.reply(&cluster, Message::found("needle", &client));

        assert_eq!(recv(&mut results).await.to_string(), "FND*|*1");
        assert_eq!(recv(&mut results).await.command, Command::Exit);
        assert_eq!(w2.inbox.try_recv().unwrap().command, Command::Abort);
        assert!(w1.inbox.try_recv().is_err());

        // A late answer for the finished request changes nothing.
        w2.reply(&cluster, Message::not_found("needle", &client));
        assert_eq!(cluster.nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_waits_for_every_worker() {
        let cluster = Registry::spawn(timings());
        let mut w1 = join(&cluster, 1, &["c1"]).await;
        let mut w2 = join(&cluster, 2, &["c2"]).await;

        let mut results = cluster.submit("absent").unwrap();
        let client = w1.recv().await.field(1).unwrap().to_string();
        w2.recv().await;

        w1.reply(&cluster, Message::not_found("absent", &client));
        cluster.nodes().await.unwrap();
        assert!(results.try_recv().is_err());

        w2.reply(&cluster, Message::not_found("absent", &client));
        assert_eq!(recv(&mut results).await.to_string(), "NFD*|*0");
        assert_eq!(recv(&mut results).await.command, Command::Exit);
    }

    #[tokio::test]
    async fn test_unanswered_search_expires() {
        let cluster = Registry::spawn(ClusterTimings {
            search_timeout: Duration::from_millis(100),
            ..timings()
        });
        let mut worker = join(&cluster, 1, &["c1"]).await;

        let search = tokio::spawn({
            let cluster = cluster.clone();
            async move { cluster.search("needle").await }
        });
        assert_eq!(worker.recv().await.command, Command::Search);

        let outcome = tokio::time::timeout(WAIT, search).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, SearchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_completed_search_cancels_its_expiry_timer() {
        let (mut registry, _cluster) = Registry::new(ClusterTimings {
            search_timeout: Duration::from_secs(60),
            ..timings()
        });
        let (a, _a_inbox, _) = handle(1, &["x"], &["x"]);
        let session = a.session;
        registry.workers.insert(a.id, a);

        let (reply, mut results) = mpsc::unbounded_channel();
        let client = ClientId::new();
        let timer = registry.schedule_expiry(client.clone());
        registry.clients.insert(
            client.clone(),
            ClientRequest {
                id: client.clone(),
                query: "needle".to_string(),
                reply,
                not_found: 0,
                expected: 1,
                expiry: timer.abort_handle(),
            },
        );

        registry
            .handle_event(RegistryEvent::Inbound {
                worker: WorkerId(1),
                session,
                message: Message::found("needle", &client.0),
            })
            .await;

        assert_eq!(results.try_recv().unwrap().to_string(), "FND*|*1");
        let joined = tokio::time::timeout(WAIT, timer).await.unwrap();
        assert!(joined.unwrap_err().is_cancelled());
    }

    // ==========================================
    // End to End
    // ==========================================

    struct TestCluster {
        cluster: ClusterHandle,
        worker_addr: SocketAddr,
        client_addr: SocketAddr,
        http_addr: SocketAddr,
        _dirs: Vec<tempfile::TempDir>,
    }

    async fn start_cluster() -> TestCluster {
        let cluster = Registry::spawn(timings());

        let workers = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let clients = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_addr = workers.local_addr().unwrap();
        let client_addr = clients.local_addr().unwrap();
        let http_addr = http.local_addr().unwrap();

        tokio::spawn(serve_workers(workers, cluster.clone(), timings()));
        tokio::spawn(serve_clients(clients, cluster.clone()));
        let app = router(cluster.clone());
        tokio::spawn(async move { axum::serve(http, app).await });

        let mut dirs = Vec::new();
        for (id, chunk, text) in [
            (1, "chunk_0001", "hay\nneedle\nstraw\n"),
            (2, "chunk_0002", "hay\nstraw\n"),
        ] {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(chunk), text).unwrap();
            let agent =
                WorkerAgent::with_chunks(id, dir.path().to_path_buf(), vec![chunk.to_string()]);
            tokio::spawn(async move { agent.connect(worker_addr).await });
            wait_for(&cluster, |nodes| {
                nodes.len() == id as usize && nodes.iter().all(|node| !node.memory.is_empty())
            })
            .await;
            dirs.push(dir);
        }

        TestCluster {
            cluster,
            worker_addr,
            client_addr,
            http_addr,
            _dirs: dirs,
        }
    }

    async fn wait_for<F>(cluster: &ClusterHandle, ready: F)
    where
        F: Fn(&[crate::cluster::protocol::NodeSummary]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let nodes = cluster.nodes().await.unwrap();
            if ready(&nodes) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "cluster never settled: {:?}", nodes);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Option<String> {
        tokio::time::timeout(WAIT, lines.next_line())
            .await
            .expect("timed out waiting for the coordinator")
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_search_and_nodes() {
        let test = start_cluster().await;
        let base = format!("http://{}", test.http_addr);

        let found: SearchResponse = reqwest::get(format!("{}/search?query=needle", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            found,
            SearchResponse {
                result: 1,
                node: "1".to_string()
            }
        );

        let missing: SearchResponse = reqwest::get(format!("{}/search?query=absent", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            missing,
            SearchResponse {
                result: 0,
                node: "0".to_string()
            }
        );

        let posted: SearchResponse = reqwest::Client::new()
            .post(format!("{}/search", base))
            .form(&[("query", "needle")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(posted.result, 1);

        let nodes: serde_json::Value = reqwest::get(format!("{}/nodes", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            nodes,
            serde_json::json!([
                {"name": "1", "chunks": ["chunk_0001"], "memory": ["chunk_0001"]},
                {"name": "2", "chunks": ["chunk_0002"], "memory": ["chunk_0002"]},
            ])
        );
    }

    #[tokio::test]
    async fn test_tcp_client_gets_one_result_line() {
        let test = start_cluster().await;

        let stream = TcpStream::connect(test.client_addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"needle\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();

        assert_eq!(next_line(&mut lines).await.as_deref(), Some("FND*|*1"));
        assert_eq!(next_line(&mut lines).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_worker_connection_is_refused() {
        let test = start_cluster().await;

        let stream = TcpStream::connect(test.worker_addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"1\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();

        assert_eq!(next_line(&mut lines).await.as_deref(), Some("DUP"));
        assert_eq!(next_line(&mut lines).await, None);
        assert_eq!(test.cluster.nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_session_records_peer_address() {
        let (mut registry, cluster) = Registry::new(timings());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_workers(listener, cluster.clone(), timings()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = stream.local_addr().unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"4\n").await.unwrap();
        let claim = tokio::time::timeout(WAIT, registry.events.recv()).await.unwrap().unwrap();
        registry.handle_event(claim).await;
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("OKY"));

        writer.write_all(b"\n").await.unwrap();
        let joined = tokio::time::timeout(WAIT, registry.events.recv()).await.unwrap().unwrap();
        registry.handle_event(joined).await;

        assert_eq!(registry.workers[&WorkerId(4)].addr, Some(peer));
    }

    #[tokio::test]
    async fn test_silent_worker_is_removed_after_heartbeat_timeout() {
        let cluster = Registry::spawn(timings());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_workers(listener, cluster.clone(), timings()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"5\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("OKY"));
        writer.write_all(b"chunk_0005\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("LOD*|*chunk_0005"));
        writer.write_all(b"MMF*|*chunk_0005\n").await.unwrap();

        assert_eq!(next_line(&mut lines).await.as_deref(), Some("HBT"));
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("EXT"));
        assert_eq!(next_line(&mut lines).await, None);

        wait_for(&cluster, |nodes| nodes.is_empty()).await;
    }
}
