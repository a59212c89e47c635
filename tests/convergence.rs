//! Randomized multi-client simulation against an in-process server.
//!
//! Each client has a FIFO link to the server and receives server messages
//! through its outbound queue. Steps are interleaved at random: local edits,
//! delivering a client's next submission, delivering a server message. Once
//! every queue drains all replicas must hold the server's document.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tokio::sync::mpsc;

use ot_collab::ot::TextOperation;
use ot_collab::storage::ChannelStore;
use ot_collab::sync::client::Submission;
use ot_collab::sync::protocol::ServerMessage;
use ot_collab::sync::{ClientSync, Snapshot, SyncServer};

const CHANNEL: &str = "sim";

struct SimClient {
    peer_id: String,
    sync: Option<ClientSync>,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    outbox: VecDeque<Submission>,
}

impl SimClient {
    fn connect(server: &SyncServer, peer_id: &str) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        server.register_peer(peer_id, peer_id, tx).unwrap();
        server.join_channel(peer_id, CHANNEL).unwrap();
        Self {
            peer_id: peer_id.to_string(),
            sync: None,
            inbox,
            outbox: VecDeque::new(),
        }
    }

    fn replica(&mut self) -> &mut ClientSync {
        self.sync.as_mut().expect("Init not received yet")
    }

    /// Process one message from the server. Returns false if none was queued.
    fn receive(&mut self) -> bool {
        let Ok(msg) = self.inbox.try_recv() else {
            return false;
        };

        match msg {
            ServerMessage::Init {
                document, revision, ..
            } => {
                self.sync = Some(ClientSync::new(Snapshot { document, revision }));
            }
            ServerMessage::Ack { revision, .. } => {
                if let Some(next) = self.replica().acknowledge(revision).unwrap() {
                    self.outbox.push_back(next);
                }
            }
            ServerMessage::RemoteOperation {
                revision,
                operation,
                ..
            } => {
                self.replica().apply_remote(revision, operation).unwrap();
            }
            other => panic!("{} got unexpected message {other:?}", self.peer_id),
        }
        true
    }

    fn edit(&mut self, rng: &mut StdRng) {
        if self.sync.is_none() {
            return;
        }
        let operation = random_edit(rng, self.replica().document());
        if let Some(submission) = self.replica().apply_local(operation).unwrap() {
            self.outbox.push_back(submission);
        }
    }

    fn submit(&mut self, server: &SyncServer) -> bool {
        let Some(submission) = self.outbox.pop_front() else {
            return false;
        };
        server
            .submit_operation(
                &self.peer_id,
                CHANNEL,
                submission.base_revision,
                submission.operation,
            )
            .unwrap();
        true
    }
}

fn random_text(rng: &mut StdRng) -> String {
    const ALPHABET: &[char] = &['a', 'b', 'c', ' ', 'é', '漢', '\n'];
    let len = rng.gen_range(1..4);
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
        .collect()
}

fn random_edit(rng: &mut StdRng, document: &str) -> TextOperation {
    let len = document.chars().count();
    let mut op = TextOperation::new();
    let mut remaining = len;

    while remaining > 0 {
        let span = rng.gen_range(1..=remaining.min(4));
        match rng.gen_range(0..4) {
            0 => {
                op.insert(&random_text(rng));
            }
            1 => {
                op.delete(span);
                remaining -= span;
            }
            _ => {
                op.retain(span);
                remaining -= span;
            }
        }
    }
    if rng.gen_bool(0.5) {
        op.insert(&random_text(rng));
    }
    op
}

fn run_simulation(seed: u64, clients: usize, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let server = SyncServer::with_storage(ChannelStore::temporary().unwrap());
    let mut sims: Vec<SimClient> = (0..clients)
        .map(|i| SimClient::connect(&server, &format!("client-{i}")))
        .collect();

    for _ in 0..steps {
        let sim = &mut sims[rng.gen_range(0..clients)];
        match rng.gen_range(0..3) {
            0 => sim.edit(&mut rng),
            1 => {
                sim.submit(&server);
            }
            _ => {
                sim.receive();
            }
        }
    }

    // Quiesce: deliver everything still in flight
    loop {
        let mut progressed = false;
        for sim in sims.iter_mut() {
            while sim.receive() {
                progressed = true;
            }
            while sim.submit(&server) {
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let canonical = server.channel_snapshot(CHANNEL).unwrap();
    for sim in sims.iter_mut() {
        let peer_id = sim.peer_id.clone();
        let replica = sim.replica();
        assert!(!replica.has_pending(), "{peer_id} still has pending edits");
        assert_eq!(replica.revision(), canonical.revision, "{peer_id} revision");
        assert_eq!(replica.document(), canonical.document, "{peer_id} diverged");
    }
}

#[test]
fn test_two_clients_converge() {
    for seed in 0..50 {
        run_simulation(seed, 2, 200);
    }
}

#[test]
fn test_many_clients_converge() {
    for seed in 100..120 {
        run_simulation(seed, 5, 600);
    }
}

#[test]
fn test_late_joiner_converges() {
    let mut rng = StdRng::seed_from_u64(7);
    let server = SyncServer::with_storage(ChannelStore::temporary().unwrap());
    let mut early = SimClient::connect(&server, "early");
    early.receive();

    for _ in 0..20 {
        early.edit(&mut rng);
        early.submit(&server);
        while early.receive() {}
    }

    let mut late = SimClient::connect(&server, "late");
    late.receive();
    assert_eq!(
        late.replica().document(),
        server.channel_snapshot(CHANNEL).unwrap().document
    );

    late.edit(&mut rng);
    early.edit(&mut rng);
    while late.submit(&server) | early.submit(&server) | late.receive() | early.receive() {}
    while late.receive() | early.receive() | late.submit(&server) | early.submit(&server) {}

    assert_eq!(late.replica().document(), early.replica().document());
}
