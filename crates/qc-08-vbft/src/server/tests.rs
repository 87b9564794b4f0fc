use std::sync::Arc;
use std::time::Duration;

use super::builder::proposal_target;
use super::*;
use crate::adapters::{InMemoryBlockStore, InMemoryNetwork, InMemoryTxPool, K256Signer};
use crate::domain::chain_config::tests::settings;
use crate::domain::{vrf_from_proof, vrf_input, GenesisSettings, PosTableBuilder, Transaction};

const GENESIS_TS: u32 = 1_600_000_000;

struct Committee {
    nodes: Vec<VbftServer>,
    pubkeys: Vec<PublicKey>,
    tx_pools: Vec<Arc<InMemoryTxPool>>,
    settings: GenesisSettings,
}

impl Committee {
    fn start(n: u32, c: u32) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let signers: Vec<Arc<K256Signer>> = (0..n as u64)
            .map(|i| Arc::new(K256Signer::from_seed(100 + i)))
            .collect();
        let pubkeys: Vec<PublicKey> = signers.iter().map(|s| s.public_key()).collect();

        let mut settings = settings(n, c);
        for (stake, pk) in settings.peers.iter_mut().zip(&pubkeys) {
            stake.id = pk.clone();
        }
        let cfg = PosTableBuilder::new(settings.clone(), [7u8; 32], GENESIS_TS)
            .build(1)
            .unwrap();
        let genesis = Block::genesis(cfg, GENESIS_TS as u64);

        let network = InMemoryNetwork::new();
        let mut nodes = Vec::new();
        let mut tx_pools = Vec::new();
        for (i, signer) in signers.into_iter().enumerate() {
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
            .unwrap();
            server.spawn_inbound(inbox);
            nodes.push(server);
            tx_pools.push(tx_pool);
        }

        for node in &nodes {
            for (j, pk) in pubkeys.iter().enumerate() {
                let peer = j as u32 + 1;
                if peer != node.local_index() {
                    node.peer_connected(peer, pk.clone());
                }
            }
        }

        Self {
            nodes,
            pubkeys,
            tx_pools,
            settings,
        }
    }

    fn min_height(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| n.committed_height())
            .min()
            .unwrap_or(0)
    }

    async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await;
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

#[tokio::test(start_paused = true)]
async fn test_committee_seals_same_chain() {
    let committee = Committee::start(4, 1);
    assert!(
        wait_until(Duration::from_secs(120), || committee.min_height() >= 3).await,
        "committee stuck at {}",
        committee.min_height()
    );

    for height in 1..=3 {
        let hashes: Vec<Hash> = committee
            .nodes
            .iter()
            .map(|n| n.sealed_block(height).unwrap().hash())
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]), "fork at {}", height);

        let block = committee.nodes[0].sealed_block(height).unwrap();
        assert_eq!(block.block_num(), height);
        assert_eq!(
            block.prev_block_hash(),
            committee.nodes[0].sealed_block(height - 1).unwrap().hash()
        );
        // proposer plus more than C endorsers
        assert!(block.block.sig_data.len() >= 2);
        assert_eq!(block.block.sig_data.len(), block.block.bookkeepers.len());
    }

    for node in &committee.nodes {
        assert!(node.state().is_ready());
        assert!(node.current_block_num() > node.committed_height());
    }
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_committee_includes_transactions() {
    let committee = Committee::start(4, 1);
    assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

    let tx = Transaction(b"transfer 10".to_vec());
    for pool in &committee.tx_pools {
        pool.submit(tx.clone());
    }

    let node = &committee.nodes[0];
    let included = wait_until(Duration::from_secs(120), || {
        (1..=node.committed_height())
            .filter_map(|h| node.sealed_block(h))
            .any(|b| b.block.transactions.contains(&tx))
    })
    .await;
    assert!(included);
    assert!(
        wait_until(Duration::from_secs(30), || committee
            .tx_pools
            .iter()
            .all(|p| p.is_empty()))
        .await
    );
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_roles_cover_committee() {
    let committee = Committee::start(4, 1);
    assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

    let core = committee.nodes[0].core();
    let block_num = core.current_block_num();
    core.update_participant_config().unwrap();

    let peers: Vec<PeerIndex> = (1..=4).collect();
    let leaders: Vec<_> = peers
        .iter()
        .filter(|p| **p != core.local && core.is_proposer(block_num, **p))
        .collect();
    assert!(leaders.len() <= 1);
    assert!(peers.iter().any(|p| core.is_endorser(block_num, *p)));
    assert!(peers.iter().any(|p| core.is_committer(block_num, *p)));

    // no roles for a round without participants
    assert!(!core.is_endorser(block_num + 5, 1));
    assert!(!core.is_committer(block_num + 5, 1));
    assert_eq!(core.proposer_rank(block_num + 5, 1), None);
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_highest_rank_proposal_errors() {
    let committee = Committee::start(4, 1);
    let core = committee.nodes[0].core();

    assert!(matches!(
        core.get_highest_rank_proposal(1, &[]),
        Err(ConsensusError::NoCandidate(1))
    ));

    let proposal = Arc::new(core.build_proposal_msg(1, false).unwrap());
    assert!(matches!(
        core.get_highest_rank_proposal(2, &[proposal.clone()]),
        Err(ConsensusError::InvariantViolation(_))
    ));
    let best = core.get_highest_rank_proposal(1, &[proposal.clone()]).unwrap();
    assert_eq!(best.proposer(), core.local);
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_proposal_carries_verifiable_vrf() {
    let committee = Committee::start(4, 1);
    let core = committee.nodes[1].core();
    let proposal = core.build_proposal_msg(1, false).unwrap();
    let info = proposal.block.info();

    let (genesis, genesis_hash) = core.block_pool.get_sealed_block(0).unwrap();
    let input = vrf_input(1, &genesis.info().vrf_value).unwrap();
    core.signer
        .verify(&committee.pubkeys[1], &input, &info.vrf_proof)
        .unwrap();
    assert_eq!(info.vrf_value, vrf_from_proof(&info.vrf_proof));
    assert_eq!(proposal.block.prev_block_hash(), genesis_hash);
    assert!(proposal.block.empty_block.is_some());

    let (hash, sig) = proposal_target(&proposal, true).unwrap();
    core.signer.verify(&committee.pubkeys[1], &hash, &sig).unwrap();
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_block_infos_after_sealing() {
    let committee = Committee::start(4, 1);
    assert!(wait_until(Duration::from_secs(120), || committee.min_height() >= 2).await);

    let core = committee.nodes[2].core();
    let infos = core.build_block_infos(1);
    assert!(infos.len() as u32 >= 2);
    for (i, info) in infos.iter().enumerate() {
        assert_eq!(info.block_num, i as u32 + 1);
        let block = committee.nodes[2].sealed_block(info.block_num).unwrap();
        assert_eq!(info.proposer, block.proposer());
        assert!(info.signatures.contains_key(&info.proposer));
    }
    assert!(core.build_block_infos(core.committed_height() + 1).is_empty());
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_forged_heartbeat_rejected() {
    let committee = Committee::start(4, 1);
    let core = committee.nodes[0].core();

    let honest = committee.nodes[1].core().build_heartbeat_msg().unwrap();
    core.verify_from(2, &ConsensusMsg::Heartbeat(honest.clone()))
        .unwrap();

    // node 3 posing as node 2
    let forged = committee.nodes[2].core().build_heartbeat_msg().unwrap();
    assert!(matches!(
        core.verify_from(2, &ConsensusMsg::Heartbeat(forged)),
        Err(ConsensusError::InvalidSignature(_))
    ));

    let mut raised = honest;
    raised.committed_block_number = u32::MAX;
    let payload = encode_msg(&ConsensusMsg::Heartbeat(raised)).unwrap();
    core.on_peer_payload(2, payload).await;
    assert!(core
        .peer_pool
        .peer_heights()
        .iter()
        .all(|(_, h)| *h != u32::MAX));
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_signed_fetch_messages_verify() {
    let committee = Committee::start(4, 1);
    let core = committee.nodes[0].core();
    let requester = committee.nodes[3].core();

    let fetch = ConsensusMsg::BlockFetch(requester.build_block_fetch_msg(0).unwrap());
    core.verify_from(4, &fetch).unwrap();
    assert!(core.verify_from(3, &fetch).is_err());

    let resp = ConsensusMsg::BlockFetchResp(core.build_block_fetch_resp_msg(0).unwrap());
    requester.verify_from(1, &resp).unwrap();
    assert!(matches!(
        core.build_block_fetch_resp_msg(1_000),
        Err(ConsensusError::BlockNotFound(1_000))
    ));
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fast_forward_refused_while_active() {
    let committee = Committee::start(4, 1);
    assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

    let node = &committee.nodes[3];
    let block = node.sealed_block(1).unwrap();
    assert!(matches!(
        node.core().fast_forward_block(block),
        Err(ConsensusError::InvalidState(_))
    ));
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_update_chain_config_rejects_stale_view() {
    let committee = Committee::start(4, 1);
    let node = &committee.nodes[0];
    let current = node.core().chain_config().as_ref().clone();

    assert!(matches!(
        node.update_chain_config(current.clone()),
        Err(ConsensusError::InvalidChainConfig(_))
    ));

    let mut zero = current;
    zero.view = 0;
    assert!(node.update_chain_config(zero).is_err());
    assert!(node.core().meta.read().pending_chain_config.is_none());
    committee.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_chain_config_change_takes_effect() {
    let committee = Committee::start(4, 1);
    assert!(wait_until(Duration::from_secs(60), || committee.min_height() >= 1).await);

    let mut next = committee.settings.clone();
    next.block_msg_delay = Duration::from_millis(200);
    let cfg = PosTableBuilder::new(next, [9u8; 32], GENESIS_TS + 1)
        .build(2)
        .unwrap();
    for node in &committee.nodes {
        node.update_chain_config(cfg.clone()).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(120), || committee
            .nodes
            .iter()
            .all(|n| n.core().chain_config().view == 2))
        .await
    );
    let height = committee.min_height();
    for node in &committee.nodes {
        let core = node.core();
        assert!(core.meta.read().pending_chain_config.is_none());
        assert_eq!(*core.timer.timing(), TimingConfig::from_chain_config(&cfg));
    }

    // rounds keep going under the new view
    assert!(wait_until(Duration::from_secs(120), || committee.min_height() >= height + 2).await);
    committee.stop().await;
}
