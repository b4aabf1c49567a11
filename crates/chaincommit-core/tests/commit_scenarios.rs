//! Commit confirmation across scoped policies on an in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use chaincommit_core::{
    BlockEvent, CommitPolicy, CommitState, EventConfig, EventContext, GatewayError, InMemoryChannel, PeerRef,
    TransactionEvent,
};

const TX: &str = "txId";
const WAIT: Duration = Duration::from_secs(2);

struct Network {
    channel: Arc<InMemoryChannel>,
    context: EventContext,
    org1_peer1: PeerRef,
    org1_peer2: PeerRef,
    org2_peer1: PeerRef,
}

fn network() -> Network {
    let channel = Arc::new(InMemoryChannel::new("mychannel"));
    let org1_peer1 = PeerRef::new("peer1.org1", "Org1MSP");
    let org1_peer2 = PeerRef::new("peer2.org1", "Org1MSP");
    let org2_peer1 = PeerRef::new("peer1.org2", "Org2MSP");
    for peer in [&org1_peer1, &org1_peer2, &org2_peer1] {
        channel.add_peer(peer.clone());
    }
    // ledger-only peer: never a commit target
    channel.add_peer(PeerRef::with_roles("peer3.org1", "Org1MSP", false));
    let context = EventContext::new(channel.clone(), EventConfig::for_organization("Org1MSP"));
    Network {
        channel,
        context,
        org1_peer1,
        org1_peer2,
        org2_peer1,
    }
}

fn report(channel: &InMemoryChannel, peer: &PeerRef, valid: bool) {
    channel.send_block(BlockEvent::new(
        1,
        vec![TransactionEvent::new(TX, peer.clone(), valid)],
    ));
}

#[tokio::test]
async fn network_all_succeeds_when_every_peer_reports_valid() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAll);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, true);
    report(&n.channel, &n.org1_peer2, true);
    assert_eq!(handler.state(), CommitState::Listening);
    report(&n.channel, &n.org2_peer1, true);

    handler.wait_for_outcome(WAIT).await.unwrap();
    assert_eq!(n.channel.active_subscriptions(), 0);
}

#[tokio::test]
async fn network_all_fails_on_single_rejection() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAll);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, true);
    report(&n.channel, &n.org2_peer1, false);

    let err = handler.wait_for_outcome(WAIT).await.unwrap_err();
    assert!(err.is_commit_failure());
    assert_eq!(
        err,
        GatewayError::CommitRejected {
            transaction_id: TX.into(),
            peers: vec!["peer1.org2".into()],
        }
    );
}

#[tokio::test]
async fn all_stays_rejected_when_a_later_peer_reports_valid() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::OrgScopeAll);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, false);
    report(&n.channel, &n.org1_peer2, true);

    assert_eq!(handler.state(), CommitState::Failed);
    assert_eq!(
        handler.wait_for_outcome(WAIT).await,
        Err(GatewayError::CommitRejected {
            transaction_id: TX.into(),
            peers: vec!["peer1.org1".into()],
        })
    );
    assert_eq!(handler.state(), CommitState::Failed);
}

#[tokio::test]
async fn network_all_fails_when_every_peer_disconnects() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAll);
    handler.start_listening().unwrap();

    for peer in [&n.org1_peer1, &n.org1_peer2, &n.org2_peer1] {
        n.channel.disconnect_peer(peer);
    }

    assert!(matches!(
        handler.wait_for_outcome(WAIT).await,
        Err(GatewayError::AllPeersUnreachable { .. })
    ));
}

#[tokio::test]
async fn network_all_succeeds_with_one_valid_and_rest_disconnected() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAll);
    handler.start_listening().unwrap();

    n.channel.disconnect_peer(&n.org1_peer1);
    report(&n.channel, &n.org1_peer2, true);
    n.channel.disconnect_peer(&n.org2_peer1);

    handler.wait_for_outcome(WAIT).await.unwrap();
}

#[tokio::test]
async fn duplicate_reports_are_counted_once() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::OrgScopeAll);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, true);
    report(&n.channel, &n.org1_peer1, true);
    n.channel.disconnect_peer(&n.org1_peer1);
    assert_eq!(handler.state(), CommitState::Listening);

    report(&n.channel, &n.org1_peer2, true);
    handler.wait_for_outcome(WAIT).await.unwrap();
}

#[tokio::test]
async fn disconnect_after_success_is_ignored() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::OrgScopeAny);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, true);
    n.channel.disconnect_peer(&n.org1_peer1);
    n.channel.disconnect_peer(&n.org1_peer2);

    handler.wait_for_outcome(WAIT).await.unwrap();
    assert_eq!(handler.state(), CommitState::Succeeded);
}

#[tokio::test]
async fn org_scope_ignores_other_organizations() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::OrgScopeAll);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org2_peer1, false);
    assert_eq!(handler.state(), CommitState::Listening);

    report(&n.channel, &n.org1_peer1, true);
    report(&n.channel, &n.org1_peer2, true);
    handler.wait_for_outcome(WAIT).await.unwrap();
}

#[tokio::test]
async fn network_any_survives_a_rejection() {
    let n = network();
    let handler = n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAny);
    handler.start_listening().unwrap();

    report(&n.channel, &n.org1_peer1, false);
    assert_eq!(handler.state(), CommitState::Listening);
    report(&n.channel, &n.org2_peer1, true);

    handler.wait_for_outcome(WAIT).await.unwrap();
}

#[tokio::test]
async fn timeout_is_distinct_from_failure() {
    let n = network();
    let handler = n.context.create_commit_handler(TX);
    handler.start_listening().unwrap();

    let err = handler.wait_for_outcome(Duration::from_millis(25)).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_commit_failure());

    handler.cancel_listening();
    handler.cancel_listening();
    assert_eq!(handler.state(), CommitState::Cancelled);
    assert_eq!(n.channel.active_subscriptions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_delivery_threads() {
    let n = network();
    let handler: Arc<dyn chaincommit_core::CommitHandler> =
        Arc::from(n.context.create_commit_handler_with(TX, CommitPolicy::NetworkScopeAll));
    handler.start_listening().unwrap();

    let waiter = {
        let handler = handler.clone();
        tokio::spawn(async move { handler.wait_for_outcome(WAIT).await })
    };

    let mut deliveries = vec![];
    for peer in [n.org1_peer1.clone(), n.org1_peer2.clone(), n.org2_peer1.clone()] {
        let channel = n.channel.clone();
        deliveries.push(std::thread::spawn(move || {
            for _ in 0..10 {
                report(&channel, &peer, true);
            }
        }));
    }
    for delivery in deliveries {
        delivery.join().unwrap();
    }

    waiter.await.unwrap().unwrap();
    assert_eq!(handler.state(), CommitState::Succeeded);
}
