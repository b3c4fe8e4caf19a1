//! End-to-end decree scenarios over an in-memory cluster.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata::memory::{Majority, MemoryArchive, MemoryWal};
use strata::{
    AcceptorWire, ActiveStatus, BallotNumber, Cluster, Config, HostId, Message, Position,
    ProposeError, Proposal, Record, Registry, Seed, Value, replay,
};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=debug")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

type Node = Registry<MemoryWal, MemoryArchive, Router, Majority>;

/// Shared fabric connecting every node's registry.
#[derive(Clone, Default)]
struct Net {
    nodes: Arc<Mutex<HashMap<HostId, Node>>>,
    /// Destinations currently unreachable.
    blackholes: Arc<Mutex<HashSet<HostId>>>,
    /// Every send attempted, including dropped ones.
    seen: Arc<Mutex<Vec<(HostId, HostId, Message)>>>,
    /// Deliver every message twice to exercise idempotence.
    duplicate: Arc<Mutex<bool>>,
}

impl Net {
    fn blackhole(&self, host: HostId) {
        self.blackholes.lock().unwrap().insert(host);
    }

    fn duplicate_delivery(&self) {
        *self.duplicate.lock().unwrap() = true;
    }

    fn sent(&self) -> Vec<(HostId, HostId, Message)> {
        self.seen.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Router {
    host: HostId,
    net: Net,
}

impl Cluster for Router {
    fn host(&self) -> HostId {
        self.host
    }

    fn send(&self, to: HostId, message: Message) {
        self.net
            .seen
            .lock()
            .unwrap()
            .push((self.host, to, message.clone()));
        if self.net.blackholes.lock().unwrap().contains(&to) {
            return;
        }
        let node = self.net.nodes.lock().unwrap().get(&to).cloned();
        let Some(node) = node else { return };
        let copies = if *self.net.duplicate.lock().unwrap() {
            2
        } else {
            1
        };
        for _ in 0..copies {
            node.deliver(self.host, message.clone());
        }
    }
}

struct TestNode {
    host: HostId,
    registry: Node,
    wal: MemoryWal,
    archive: MemoryArchive,
}

struct TestCluster {
    net: Net,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    fn new(hosts: &[u64]) -> Self {
        let net = Net::default();
        let peers: Vec<HostId> = hosts.iter().copied().map(HostId).collect();
        let atlas = Majority::new(peers.clone());
        let nodes = peers
            .iter()
            .map(|&host| {
                let wal = MemoryWal::new();
                let archive = MemoryArchive::new();
                let registry = Registry::new(
                    wal.clone(),
                    archive.clone(),
                    Router {
                        host,
                        net: net.clone(),
                    },
                    atlas.clone(),
                    Config::default(),
                );
                net.nodes.lock().unwrap().insert(host, registry.clone());
                TestNode {
                    host,
                    registry,
                    wal,
                    archive,
                }
            })
            .collect();
        Self { net, nodes }
    }

    fn node(&self, host: u64) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.host == HostId(host))
            .unwrap()
    }

    /// Wait until `check` passes, advancing virtual time as needed.
    async fn settle(&self, mut check: impl FnMut(&Self) -> bool) {
        for _ in 0..200 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("cluster did not settle");
    }
}

fn at(key: &'static str, time: u64) -> Position {
    Position::new(key, time)
}

#[tokio::test(start_paused = true)]
async fn simple_decree_at_ballot_zero() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3]);
    let decree = at("fruit", 1);

    let proposer = cluster.node(1).registry.proposer(decree.clone());
    proposer.open(0, Value::from("apple"));
    let chosen = proposer.learn().await.unwrap();
    assert_eq!(chosen, Value::from("apple"));

    cluster
        .settle(|c| {
            c.nodes
                .iter()
                .all(|node| node.archive.get(&decree) == Some(Value::from("apple")))
        })
        .await;

    // Each acceptor opened and closed; a quorum made the accept at
    // (0, proposer) durable before replying. A late minority may see its
    // queued accept superseded by the close.
    let mut accepts = 0;
    for node in &cluster.nodes {
        let records = node.wal.records_at(&decree);
        assert_eq!(
            records[0],
            Record::Open {
                at: decree.clone(),
                default: Value::from("apple"),
            }
        );
        assert!(matches!(records.last(), Some(Record::Close { .. })));
        if records.contains(&Record::Accept {
            at: decree.clone(),
            ballot: BallotNumber::new(0, HostId(1)),
            value: Value::from("apple"),
        }) {
            accepts += 1;
        }
    }
    assert!(accepts >= 2, "a quorum must hold the accept record");
}

#[tokio::test(start_paused = true)]
async fn contention_converges_on_one_value() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3]);
    let decree = at("fruit", 2);

    let first = cluster.node(1).registry.proposer(decree.clone());
    let second = cluster.node(2).registry.proposer(decree.clone());
    first.open(10, Value::from("apple"));
    second.open(11, Value::from("banana"));

    let (a, b) = tokio::join!(first.learn(), second.learn());
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one value wins and every learner sees it.
    assert_eq!(a, b);
    assert!(a == Value::from("apple") || a == Value::from("banana"));

    cluster
        .settle(|c| {
            c.nodes
                .iter()
                .all(|node| node.archive.get(&decree) == Some(a.clone()))
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn recovery_readopts_accepted_value() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);
    let decree = at("fruit", 3);

    // The previous incarnation crashed after making an accept durable but
    // before replying; its log survives.
    let journal = vec![
        Record::Open {
            at: decree.clone(),
            default: Value::from("default"),
        },
        Record::Promise {
            at: decree.clone(),
            ballot: BallotNumber::new(7, HostId(9)),
        },
        Record::Accept {
            at: decree.clone(),
            ballot: BallotNumber::new(7, HostId(9)),
            value: Value::from("apple"),
        },
    ];
    let recovered = replay(journal).unwrap();
    assert_eq!(recovered.chosen, None);
    let handle = cluster.node(1).registry.resume(decree.clone(), Seed {
        default: recovered.default.unwrap(),
        ballot: recovered.ballot,
        proposal: recovered.proposal,
    });

    // The archive lookup comes back empty and the seed carries over.
    let status = loop {
        match handle.checkpoint().await.unwrap().unwrap() {
            ActiveStatus::Restoring { .. } => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            status => break status,
        }
    };
    assert_eq!(
        status,
        ActiveStatus::Deliberating {
            at: decree.clone(),
            default: Value::from("default"),
            ballot: BallotNumber::new(7, HostId(9)),
            proposal: Some(Proposal::new(
                BallotNumber::new(7, HostId(9)),
                Value::from("apple"),
            )),
        }
    );

    // A later proposer at ballot 8 must re-propose the accepted value, not
    // its own.
    let proposer = cluster.node(1).registry.proposer(decree.clone());
    proposer.open(8, Value::from("banana"));
    let chosen = proposer.learn().await.unwrap();
    assert_eq!(chosen, Value::from("apple"));
    cluster
        .settle(|c| c.node(1).archive.get(&decree) == Some(Value::from("apple")))
        .await;
}

#[tokio::test(start_paused = true)]
async fn deliberating_timeout_adopts_default() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3]);
    let decree = at("fruit", 4);

    // A proposer queried once and vanished; host 99 is not in the cluster so
    // the promise reply goes nowhere.
    cluster
        .node(1)
        .registry
        .deliver(HostId(99), Message::Acceptor(AcceptorWire::Query {
            at: decree.clone(),
            ballot: 1,
            default: Value::from("fallback"),
        }));

    // The acceptor deliberates, times out, and drives its own default
    // through consensus.
    cluster
        .settle(|c| {
            c.nodes
                .iter()
                .all(|node| node.archive.get(&decree) == Some(Value::from("fallback")))
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_fail_with_timeout() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3]);
    let decree = at("fruit", 5);

    for host in [1, 2, 3] {
        cluster.net.blackhole(HostId(host));
    }

    let proposer = cluster.node(1).registry.proposer(decree.clone());
    proposer.open(5, Value::from("apple"));
    let err = proposer.learn().await.unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::Timeout);

    // One initial ballot plus at most `retries` fresh ones.
    let mut ballots = HashSet::new();
    for (_, _, message) in cluster.net.sent() {
        if let Message::Acceptor(AcceptorWire::Query { at, ballot, .. }) = message {
            if at == decree {
                ballots.insert(ballot);
            }
        }
    }
    let retries = Config::default().proposing_backoff.retries as usize;
    assert_eq!(ballots.len(), retries + 1);
    assert!(ballots.contains(&5));
}

#[tokio::test(start_paused = true)]
async fn duplicated_delivery_is_idempotent() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2, 3]);
    cluster.net.duplicate_delivery();
    let decree = at("fruit", 6);

    let proposer = cluster.node(2).registry.proposer(decree.clone());
    proposer.open(3, Value::from("apple"));
    let chosen = proposer.learn().await.unwrap();
    assert_eq!(chosen, Value::from("apple"));

    cluster
        .settle(|c| {
            c.nodes
                .iter()
                .all(|node| node.archive.get(&decree) == Some(Value::from("apple")))
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_choose_closes_once() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);
    let decree = at("fruit", 7);

    let acceptor = cluster.node(1).registry.acceptor(decree.clone());
    acceptor.choose(Value::from("apple"));
    acceptor.choose(Value::from("apple"));

    cluster
        .settle(|c| c.node(1).archive.get(&decree) == Some(Value::from("apple")))
        .await;
    let closes = cluster
        .node(1)
        .wal
        .records_at(&decree)
        .into_iter()
        .filter(|record| matches!(record, Record::Close { .. }))
        .count();
    assert_eq!(closes, 1);

    let status = acceptor.checkpoint().await.unwrap().unwrap();
    assert_eq!(status, ActiveStatus::Closed {
        at: decree,
        chosen: Value::from("apple"),
    });
    assert_eq!(status.default_value(), &Value::from("apple"));
}

#[tokio::test(start_paused = true)]
async fn closed_acceptor_answers_queries_with_chosen() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1, 2]);
    let decree = at("fruit", 8);

    // Host 2's acceptor already closed the decree.
    let acceptor = cluster.node(2).registry.acceptor(decree.clone());
    acceptor.choose(Value::from("apple"));
    cluster
        .settle(|c| c.node(2).archive.get(&decree) == Some(Value::from("apple")))
        .await;

    // A proposer on host 1 learns the chosen value without a fresh decree:
    // its query is answered with `chosen` directly.
    let proposer = cluster.node(1).registry.proposer(decree.clone());
    proposer.open(4, Value::from("banana"));
    let chosen = proposer.learn().await.unwrap();
    assert_eq!(chosen, Value::from("apple"));
}

#[tokio::test(start_paused = true)]
async fn learn_before_open_is_illegal() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);

    let proposer = cluster.node(1).registry.proposer(at("fruit", 9));
    let err = proposer.learn().await.unwrap_err();
    assert_eq!(err.current_context(), &ProposeError::IllegalState);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_before_first_input_is_illegal() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);

    let acceptor = cluster.node(1).registry.acceptor(at("fruit", 10));
    assert!(acceptor.checkpoint().await.is_err());

    // Shutdown is terminal and idempotent; nothing is active afterwards.
    acceptor.shutdown();
    acceptor.shutdown();
    assert_eq!(acceptor.checkpoint().await, Ok(None));
}

#[tokio::test(start_paused = true)]
async fn log_failure_panicks_the_decree() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);
    let decree = at("fruit", 11);

    cluster.node(1).wal.fail(true);
    let acceptor = cluster.node(1).registry.acceptor(decree.clone());
    acceptor.query(HostId(9), 1, Value::from("apple"));

    // The open record fails to append; the decree becomes inert.
    let inert = loop {
        match acceptor.checkpoint().await {
            Ok(None) => break true,
            Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(_) => break false,
        }
    };
    assert!(inert);
    assert_eq!(cluster.node(1).archive.get(&decree), None);
}

#[tokio::test(start_paused = true)]
async fn archive_failure_panicks_the_decree() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);
    let decree = at("fruit", 12);

    cluster.node(1).archive.fail(true);
    let acceptor = cluster.node(1).registry.acceptor(decree.clone());
    acceptor.query(HostId(9), 1, Value::from("apple"));

    let inert = loop {
        match acceptor.checkpoint().await {
            Ok(None) => break true,
            Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(_) => break false,
        }
    };
    assert!(inert);
}

#[tokio::test(start_paused = true)]
async fn restore_finds_previously_chosen_value() {
    let _guard = init_tracing();
    let cluster = TestCluster::new(&[1]);
    let decree = at("fruit", 13);

    // A previous incarnation closed the decree and was reclaimed; only the
    // archive remembers.
    cluster.node(1).archive.put(decree.clone(), Value::from("apple"));

    let proposer = cluster.node(1).registry.proposer(decree.clone());
    proposer.open(2, Value::from("banana"));
    let chosen = proposer.learn().await.unwrap();
    assert_eq!(chosen, Value::from("apple"));
}
