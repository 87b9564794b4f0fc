//! # VBFT Committee Flows
//!
//! Whole committees of in-process nodes wired over the in-memory network:
//!
//! 1. **Steady state**: every node seals the same chain, round after round
//! 2. **Transactions**: submitted transactions end up in a sealed block
//! 3. **Catch-up**: a node cut off from the committee syncs back once reconnected
//! 4. **Tolerated fault**: the committee keeps sealing with C nodes down

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use qc_08_vbft::domain::{GenesisSettings, PeerStake};
    use qc_08_vbft::{
        Block, InMemoryBlockStore, InMemoryNetwork, InMemoryTxPool, K256Signer, PosTableBuilder,
        PublicKey, ServerPorts, Signer, Transaction, VbftApi, VbftConfig, VbftServer,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const GENESIS_TS: u32 = 1_650_000_000;

    struct Node {
        server: VbftServer,
        tx_pool: Arc<InMemoryTxPool>,
    }

    struct Committee {
        network: Arc<InMemoryNetwork>,
        nodes: Vec<Node>,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn genesis_settings(pubkeys: &[PublicKey], c: u32) -> GenesisSettings {
        let n = pubkeys.len() as u32;
        GenesisSettings {
            k: n,
            c,
            l: n * 16,
            block_msg_delay: Duration::from_millis(100),
            hash_msg_delay: Duration::from_millis(50),
            peer_handshake_timeout: Duration::from_secs(2),
            max_block_change_view: 1000,
            peers: pubkeys
                .iter()
                .enumerate()
                .map(|(i, id)| PeerStake {
                    index: i as u32 + 1,
                    id: id.clone(),
                    stake: 10_000 + i as u64 * 1_000,
                })
                .collect(),
        }
    }

    impl Committee {
        /// Start `n` nodes tolerating `c` faults and connect them pairwise.
        fn start(n: u32, c: u32) -> Self {
            init_tracing();
            let signers: Vec<Arc<K256Signer>> = (0..n as u64)
                .map(|i| Arc::new(K256Signer::from_seed(7_000 + i)))
                .collect();
            let pubkeys: Vec<PublicKey> = signers.iter().map(|s| s.public_key()).collect();

            let chain_config = PosTableBuilder::new(genesis_settings(&pubkeys, c), [3u8; 32], GENESIS_TS)
                .build(1)
                .expect("genesis chain config");
            let genesis = Block::genesis(chain_config, GENESIS_TS as u64);

            let network = InMemoryNetwork::new();
            let nodes: Vec<Node> = signers
                .into_iter()
                .enumerate()
                .map(|(i, signer)| {
                    let (transport, inbox) = network.endpoint(i as u32 + 1, 4096);
                    let tx_pool = Arc::new(InMemoryTxPool::new());
                    let server = VbftServer::start(
                        VbftConfig::for_testing(),
                        ServerPorts {
                            signer,
                            store: Arc::new(InMemoryBlockStore::with_genesis(genesis.clone())),
                            transport: Arc::new(transport),
                            tx_pool: tx_pool.clone(),
                        },
                    )
                    .expect("server start");
                    server.spawn_inbound(inbox);
                    Node { server, tx_pool }
                })
                .collect();

            for node in &nodes {
                for (j, pk) in pubkeys.iter().enumerate() {
                    let peer = j as u32 + 1;
                    if peer != node.server.local_index() {
                        node.server.peer_connected(peer, pk.clone());
                    }
                }
            }
            Self { network, nodes }
        }

        fn heights(&self) -> Vec<u32> {
            self.nodes
                .iter()
                .map(|n| n.server.committed_height())
                .collect()
        }

        fn min_height_of(&self, members: &[usize]) -> u32 {
            members
                .iter()
                .map(|i| self.nodes[*i].server.committed_height())
                .min()
                .unwrap_or(0)
        }

        fn min_height(&self) -> u32 {
            self.heights().into_iter().min().unwrap_or(0)
        }

        /// Panic on any height where two nodes sealed different blocks.
        fn assert_no_fork(&self, up_to: u32) {
            for height in 1..=up_to {
                let mut hash = None;
                for node in &self.nodes {
                    let Some(block) = node.server.sealed_block(height) else {
                        continue;
                    };
                    match hash {
                        None => hash = Some(block.hash()),
                        Some(h) => assert_eq!(
                            h,
                            block.hash(),
                            "fork at {}: {} vs {}",
                            height,
                            hex::encode(h),
                            hex::encode(block.hash())
                        ),
                    }
                }
            }
        }

        async fn stop(&self) {
            for node in &self.nodes {
                node.server.stop().await;
            }
        }
    }

    async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    // =============================================================================
    // INTEGRATION TESTS: STEADY STATE
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_seven_node_committee_seals_one_chain() {
        let committee = Committee::start(7, 2);
        let reached = wait_until(Duration::from_secs(300), || committee.min_height() >= 5).await;
        assert!(reached, "heights {:?}", committee.heights());

        committee.assert_no_fork(5);
        let proposers: Vec<u32> = (1..=5)
            .filter_map(|h| committee.nodes[0].server.sealed_block(h))
            .map(|b| b.proposer())
            .collect();
        assert!(proposers.iter().all(|p| (1..=7).contains(p)));
        committee.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactions_reach_sealed_block() {
        let committee = Committee::start(4, 1);
        assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

        let txs: Vec<Transaction> = (0..5)
            .map(|_| Transaction(rand::random::<[u8; 16]>().to_vec()))
            .collect();
        for node in &committee.nodes {
            for tx in &txs {
                node.tx_pool.submit(tx.clone());
            }
        }

        let observer = &committee.nodes[1].server;
        let all_sealed = wait_until(Duration::from_secs(120), || {
            let sealed: Vec<Transaction> = (1..=observer.committed_height())
                .filter_map(|h| observer.sealed_block(h))
                .flat_map(|b| b.block.transactions)
                .collect();
            txs.iter().all(|tx| sealed.contains(tx))
        })
        .await;
        assert!(all_sealed);
        committee.assert_no_fork(committee.min_height());
        committee.stop().await;
    }

    // =============================================================================
    // INTEGRATION TESTS: FAULTS AND RECOVERY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_committee_survives_one_silent_node() {
        let committee = Committee::start(4, 1);
        assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

        committee.network.isolate(4);
        let live = [0, 1, 2];
        let start = committee.min_height_of(&live);
        let progressed = wait_until(Duration::from_secs(300), || {
            committee.min_height_of(&live) >= start + 3
        })
        .await;
        assert!(progressed, "heights {:?}", committee.heights());
        committee.assert_no_fork(committee.min_height_of(&live));
        committee.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_catches_up() {
        let committee = Committee::start(4, 1);
        assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

        committee.network.isolate(3);
        let live = [0, 1, 3];
        let behind = committee.nodes[2].server.committed_height();
        assert!(
            wait_until(Duration::from_secs(300), || committee.min_height_of(&live) >= behind + 4)
                .await
        );

        committee.network.reconnect(3);
        let target = committee.min_height_of(&live);
        let caught_up = wait_until(Duration::from_secs(300), || {
            committee.nodes[2].server.committed_height() >= target
        })
        .await;
        assert!(caught_up, "heights {:?}", committee.heights());
        committee.assert_no_fork(target);
        committee.stop().await;
    }
}
