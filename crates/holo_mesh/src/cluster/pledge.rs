//! Leaderless node id assignment.
//!
//! A joining node (the pledge) asks any known peer to assign it an id. That
//! peer becomes the responsible for the attempt: it proposes `1 + max known
//! id` to a jury, a random majority of the healthy candidates, and returns the
//! id once every juror approves. A juror approves an id at most once per
//! session and never an id at or below the highest id it knows, so two
//! concurrent proposals for the same id cannot both win.
//!
//! Nodes that left still reserve their id. They count toward the known
//! maximum but not toward the quorum.
//!
//! A rejected round retries with the previous id plus one instead of
//! re-deriving the maximum. Under contention this leaves gaps in the id space.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{Address, Node, NodeId, NodeMap, NodeState};
use crate::config::ClusterConfig;
use crate::error::Error;
use crate::message::Request;
use crate::transport::Transport;

/// Live view of every known node, including those that left.
pub type KnownNodes = Arc<dyn Fn() -> NodeMap + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PledgeRequest {
    /// Ask the receiver to act as responsible and assign a fresh id to the
    /// node reachable at `address`.
    Assign { address: Address },
    /// Ask the receiver, as a juror, to vote on `id`.
    Propose { id: NodeId, session: Uuid },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PledgeResponse {
    Assigned { id: NodeId, cluster_key: Uuid },
    Verdict { approved: bool },
    Failed(Error),
}

/// Majority of `candidates`.
pub fn quorum(candidates: usize) -> usize {
    candidates / 2 + 1
}

/// Pick a random jury of quorum size among the healthy candidates. Nodes
/// that left are not candidates.
pub fn select_jury(known: &NodeMap) -> Result<Vec<Node>, Error> {
    let quorum = quorum(known.values().filter(|n| n.state != NodeState::Left).count());
    let healthy: Vec<&Node> = known.values().filter(|n| n.is_healthy()).collect();
    if healthy.len() < quorum {
        return Err(Error::QuorumUnreachable {
            healthy: healthy.len(),
            quorum,
        });
    }
    let mut rng = rand::thread_rng();
    Ok(healthy
        .choose_multiple(&mut rng, quorum)
        .map(|node| (*node).clone())
        .collect())
}

fn max_id(known: &NodeMap) -> NodeId {
    known.keys().next_back().copied().unwrap_or(0)
}

/// Vote keeper of one node.
pub struct Juror {
    known: KnownNodes,
    approvals: Mutex<HashMap<NodeId, Uuid>>,
}

impl Juror {
    pub fn new(known: KnownNodes) -> Self {
        Self {
            known,
            approvals: Mutex::new(HashMap::new()),
        }
    }

    pub fn verdict(&self, id: NodeId, session: Uuid) -> bool {
        let max_known = max_id(&(self.known)());
        let mut approvals = self.approvals.lock().unwrap();
        if let Some(approved) = approvals.get(&id) {
            return *approved == session;
        }
        if id <= max_known {
            return false;
        }
        approvals.insert(id, session);
        true
    }
}

/// Coordinator of one assignment.
pub struct Responsible {
    transport: Arc<dyn Transport>,
    known: KnownNodes,
    cfg: ClusterConfig,
}

impl Responsible {
    pub fn new(transport: Arc<dyn Transport>, known: KnownNodes, cfg: ClusterConfig) -> Self {
        Self {
            transport,
            known,
            cfg,
        }
    }

    pub async fn propose(&self) -> anyhow::Result<NodeId> {
        let session = Uuid::new_v4();
        let mut proposed: Option<NodeId> = None;
        for round in 0..self.cfg.max_proposals {
            let known = (self.known)();
            let id = match proposed {
                Some(prev) => prev + 1,
                None => max_id(&known) + 1,
            };
            proposed = Some(id);

            let jury = select_jury(&known)?;
            match self.consult(&jury, id, session).await {
                Ok(()) => {
                    tracing::debug!(id, round, jury = jury.len(), "node id approved");
                    return Ok(id);
                }
                Err(err) => tracing::debug!(id, round, error = ?err, "node id proposal failed"),
            }
        }
        Err(Error::ProposalsExhausted {
            attempts: self.cfg.max_proposals,
        }
        .into())
    }

    /// Ask every juror concurrently. The first refusal or failure drops the
    /// remaining requests.
    async fn consult(&self, jury: &[Node], id: NodeId, session: Uuid) -> anyhow::Result<()> {
        let mut futs = FuturesUnordered::new();
        for juror in jury {
            let transport = self.transport.clone();
            let juror_id = juror.id;
            let addr = juror.address.clone();
            futs.push(async move {
                let resp = transport
                    .send(&addr, Request::Pledge(PledgeRequest::Propose { id, session }))
                    .await;
                (juror_id, resp)
            });
        }

        let all = async {
            while let Some((juror, resp)) = futs.next().await {
                let verdict = resp
                    .and_then(|resp| resp.into_pledge())
                    .with_context(|| format!("juror {juror}"))?;
                match verdict {
                    PledgeResponse::Verdict { approved: true } => {}
                    PledgeResponse::Verdict { approved: false } => {
                        return Err(Error::ProposalRejected(id).into())
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "juror {juror} answered a proposal with {other:?}"
                        ))
                        .into())
                    }
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.cfg.quorum_timeout, all)
            .await
            .map_err(|_| anyhow::anyhow!("jury for id {id} did not answer in time"))?
    }
}

/// Server side of the pledge protocol: juror for proposals, responsible for
/// assignment requests.
pub struct Arbiter {
    juror: Juror,
    responsible: Responsible,
    cluster_key: Uuid,
}

impl Arbiter {
    pub fn new(
        transport: Arc<dyn Transport>,
        known: KnownNodes,
        cfg: ClusterConfig,
        cluster_key: Uuid,
    ) -> Self {
        Self {
            juror: Juror::new(known.clone()),
            responsible: Responsible::new(transport, known, cfg),
            cluster_key,
        }
    }

    pub async fn handle(&self, req: PledgeRequest) -> PledgeResponse {
        match req {
            PledgeRequest::Propose { id, session } => PledgeResponse::Verdict {
                approved: self.juror.verdict(id, session),
            },
            PledgeRequest::Assign { .. } => match self.responsible.propose().await {
                Ok(id) => PledgeResponse::Assigned {
                    id,
                    cluster_key: self.cluster_key,
                },
                Err(err) => {
                    tracing::debug!(error = ?err, "node id assignment failed");
                    PledgeResponse::Failed(
                        Error::find(&err)
                            .cloned()
                            .unwrap_or_else(|| Error::Remote(format!("{err:#}"))),
                    )
                }
            },
        }
    }
}

/// Obtain a node id for `address` from one of `peers`.
///
/// Peers are tried round-robin with a geometric, jittered backoff until one
/// assigns an id or `cancel` fires. On cancellation the last failure is
/// returned with context.
pub async fn pledge(
    transport: &dyn Transport,
    address: &Address,
    peers: &[Address],
    cfg: &ClusterConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<(NodeId, Uuid)> {
    anyhow::ensure!(!peers.is_empty(), "pledge needs at least one peer");
    // A responsible may run every proposal round before answering.
    let assign_timeout = cfg.request_timeout + cfg.quorum_timeout * cfg.max_proposals as u32;
    let mut last_err: Option<anyhow::Error> = None;
    let mut attempt: u32 = 0;
    loop {
        let peer = &peers[attempt as usize % peers.len()];
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(last_err)),
            res = tokio::time::timeout(
                assign_timeout,
                transport.send(
                    peer,
                    Request::Pledge(PledgeRequest::Assign {
                        address: address.clone(),
                    }),
                ),
            ) => res,
        };
        let outcome = match res {
            Err(_) => Err(anyhow::anyhow!("pledge to {peer} timed out")),
            Ok(resp) => resp.and_then(|resp| resp.into_pledge()),
        };
        match outcome {
            Ok(PledgeResponse::Assigned { id, cluster_key }) => {
                tracing::info!(id, responsible = %peer, "node id assigned");
                return Ok((id, cluster_key));
            }
            Ok(PledgeResponse::Failed(err)) => last_err = Some(err.into()),
            Ok(other) => {
                last_err = Some(
                    Error::Protocol(format!("{peer} answered a pledge with {other:?}")).into(),
                )
            }
            Err(err) => last_err = Some(err.context(format!("pledge to {peer}"))),
        }
        if let Some(err) = &last_err {
            tracing::debug!(attempt, peer = %peer, error = ?err, "pledge attempt failed");
        }

        let jitter = {
            let max = cfg.pledge_base_interval.as_millis() as u64 / 4;
            std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(last_err)),
            _ = tokio::time::sleep(cfg.pledge_backoff(attempt) + jitter) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

fn cancelled(last_err: Option<anyhow::Error>) -> anyhow::Error {
    match last_err {
        Some(err) => err.context("pledge cancelled"),
        None => Error::Cancelled.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;
    use crate::transport::mem::MemNetwork;
    use crate::transport::Handler;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ArbiterHandler(Arc<Arbiter>);

    #[async_trait]
    impl Handler for ArbiterHandler {
        async fn handle(&self, req: Request) -> anyhow::Result<Response> {
            match req {
                Request::Pledge(req) => Ok(Response::Pledge(self.0.handle(req).await)),
                other => anyhow::bail!("unexpected {}", other.kind()),
            }
        }
    }

    fn addr(id: NodeId) -> Address {
        Address::new(format!("arbiter-{id}"))
    }

    fn nodes(ids: impl IntoIterator<Item = NodeId>) -> NodeMap {
        ids.into_iter().map(|id| (id, Node::new(id, addr(id)))).collect()
    }

    fn fixed(map: NodeMap) -> KnownNodes {
        Arc::new(move || map.clone())
    }

    fn cfg() -> ClusterConfig {
        ClusterConfig {
            pledge_base_interval: Duration::from_millis(10),
            pledge_max_interval: Duration::from_millis(50),
            quorum_timeout: Duration::from_millis(200),
            max_proposals: 20,
            ..ClusterConfig::default()
        }
    }

    fn spawn_arbiter(net: &MemNetwork, id: NodeId, known: KnownNodes) {
        let transport = net.endpoint(addr(id));
        let arbiter = Arbiter::new(transport.clone(), known, cfg(), Uuid::nil());
        transport
            .bind(Arc::new(ArbiterHandler(Arc::new(arbiter))))
            .unwrap();
    }

    #[test]
    fn juror_rejects_known_and_reused_ids() {
        let juror = Juror::new(fixed(nodes(1..=3)));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(!juror.verdict(3, a));
        assert!(juror.verdict(4, a));
        assert!(juror.verdict(4, a), "same session is idempotent");
        assert!(!juror.verdict(4, b));
        assert!(juror.verdict(5, b));
    }

    #[test]
    fn left_nodes_keep_their_id_reserved() {
        let mut map = nodes(1..=3);
        map.get_mut(&3).unwrap().state = NodeState::Left;
        let juror = Juror::new(fixed(map.clone()));
        assert!(!juror.verdict(3, Uuid::new_v4()));
        // Two remaining candidates need both votes.
        assert_eq!(select_jury(&map).unwrap().len(), 2);
    }

    #[test]
    fn jury_is_a_majority_of_all_candidates() {
        let mut map = nodes(1..=5);
        assert_eq!(select_jury(&map).unwrap().len(), 3);
        for id in 1..=3 {
            map.get_mut(&id).unwrap().state = NodeState::Dead;
        }
        assert_eq!(
            select_jury(&map).unwrap_err(),
            Error::QuorumUnreachable {
                healthy: 2,
                quorum: 3
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pledges_get_distinct_ids() {
        let net = MemNetwork::new();
        let arbiters = nodes(1..=10);
        for id in 1..=10 {
            spawn_arbiter(&net, id, fixed(arbiters.clone()));
        }

        let mut tasks = Vec::new();
        for i in 0..5u64 {
            let transport = net.endpoint(format!("pledge-{i}"));
            let peers = vec![addr(i % 10 + 1), addr((i + 3) % 10 + 1)];
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let me = transport.address().clone();
                pledge(transport.as_ref(), &me, &peers, &cfg(), &cancel).await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            let (id, _) = task.await.unwrap().unwrap();
            assert!(id > 10);
            ids.push(id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn partial_knowledge_still_assigns_above_cluster_max() {
        let net = MemNetwork::new();
        // Responsible 1 only knows 0..=7; jurors 0..=7 know 0..=9.
        spawn_arbiter(&net, 1, fixed(nodes(0..=7)));
        for id in (0..=7).filter(|id| *id != 1) {
            spawn_arbiter(&net, id, fixed(nodes(0..=9)));
        }
        let transport = net.endpoint("pledge");
        let resp = transport
            .send(
                &addr(1),
                Request::Pledge(PledgeRequest::Assign {
                    address: "pledge".into(),
                }),
            )
            .await
            .unwrap()
            .into_pledge()
            .unwrap();
        match resp {
            PledgeResponse::Assigned { id, .. } => assert_eq!(id, 10),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn pledge_never_succeeds_without_quorum() {
        let net = MemNetwork::new();
        let mut view = nodes(1..=5);
        for id in 3..=5 {
            view.get_mut(&id).unwrap().state = NodeState::Dead;
        }
        for id in 1..=2 {
            spawn_arbiter(&net, id, fixed(view.clone()));
        }

        let transport = net.endpoint("pledge");
        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            deadline.cancel();
        });
        let me = transport.address().clone();
        let err = pledge(transport.as_ref(), &me, &[addr(1), addr(2)], &cfg(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            Error::find(&err),
            Some(Error::QuorumUnreachable { quorum: 3, .. })
        ));
    }

    #[tokio::test]
    async fn pledge_without_peers_fails_fast() {
        let net = MemNetwork::new();
        let transport = net.endpoint("pledge");
        let cancel = CancellationToken::new();
        let me = transport.address().clone();
        assert!(pledge(transport.as_ref(), &me, &[], &cfg(), &cancel)
            .await
            .is_err());
    }
}
