//! End-to-end frame exchange between supervisors over in-process links.

mod common;

use common::{WAIT, collect, fast_config, frame, inproc, pair, spec};
use framelane::{
    Ack, AckStatus, AdmissionPolicy, HealthEvent, SocketPattern, SocketRole, SourceFilter, TransportError,
    TransportSupervisor,
};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn duplicate_publish_through_dealer_and_router_is_delivered_once() {
    common::init_tracing();
    let address = inproc("dedup");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Router, SocketRole::Bind, &address)),
        fast_config().with_egress(spec(SocketPattern::Dealer, SocketRole::Connect, &address)),
    )
    .await;

    let cam = frame("cam1", 100);
    assert_eq!(sender.publish(&cam).await.unwrap(), Ack::Confirmed(AckStatus::Admitted));
    assert_eq!(sender.publish(&cam).await.unwrap(), Ack::Confirmed(AckStatus::Duplicate));

    let delivered = receiver.poll("cam1", WAIT).await.unwrap().unwrap();
    assert_eq!(delivered, cam);
    assert!(delivered.keyframe());
    assert_eq!(receiver.poll("cam1", Duration::from_millis(50)).await.unwrap(), None);

    let lane = receiver.metrics().lane("cam1").cloned().unwrap();
    assert_eq!(lane.admitted, 1);
    assert_eq!(lane.duplicates, 1);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn strictly_increasing_ids_arrive_in_order() {
    let address = inproc("order");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address)),
        fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Connect, &address)),
    )
    .await;

    let ids = [1, 2, 3, 10, 11, 50];
    for id in ids {
        assert_eq!(sender.publish(&frame("cam1", id)).await.unwrap(), Ack::Queued);
    }
    assert_eq!(collect(&receiver, "cam1", ids.len()).await, ids.to_vec());

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn pub_fans_out_to_every_subscriber() {
    let address = inproc("fanout");
    let publisher =
        TransportSupervisor::start(fast_config().with_egress(spec(SocketPattern::Pub, SocketRole::Bind, &address)))
            .await
            .unwrap();
    let context = publisher.context().clone();

    let mut subscribers = Vec::new();
    for _ in 0..2 {
        let config = fast_config().with_ingress(spec(SocketPattern::Sub, SocketRole::Connect, &address));
        subscribers.push(TransportSupervisor::start_with_context(config, context.clone()).await.unwrap());
    }
    let binding = &publisher.egress()[0];
    wait_until(|| binding.snapshot().connected_peers == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for id in 1..=3 {
        publisher.publish(&frame("cam1", id)).await.unwrap();
    }
    for subscriber in &subscribers {
        assert_eq!(collect(subscriber, "cam1", 3).await, vec![1, 2, 3]);
    }

    for subscriber in &subscribers {
        subscriber.shutdown().await;
    }
    publisher.shutdown().await;
}

#[tokio::test]
async fn push_spreads_frames_over_pullers() {
    let address = inproc("spread");
    let pusher =
        TransportSupervisor::start(fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Bind, &address)))
            .await
            .unwrap();
    let context = pusher.context().clone();

    let mut pullers = Vec::new();
    for _ in 0..2 {
        let config = fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Connect, &address));
        pullers.push(TransportSupervisor::start_with_context(config, context.clone()).await.unwrap());
    }
    let binding = &pusher.egress()[0];
    wait_until(|| binding.snapshot().connected_peers == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for id in 1..=10 {
        pusher.publish(&frame("cam1", id)).await.unwrap();
    }

    let mut received = Vec::new();
    for puller in &pullers {
        let mut ids = Vec::new();
        while let Some(frame) = puller.poll("cam1", Duration::from_millis(200)).await.unwrap() {
            ids.push(frame.frame_id());
        }
        assert!(!ids.is_empty(), "every puller gets a share");
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "per-lane order holds: {ids:?}");
        received.extend(ids);
    }
    received.sort();
    assert_eq!(received, (1..=10).collect::<Vec<_>>());

    for puller in &pullers {
        puller.shutdown().await;
    }
    pusher.shutdown().await;
}

#[tokio::test]
async fn prefix_filter_admits_matching_sources_only() {
    let address = inproc("prefix");
    let (receiver, sender) = pair(
        fast_config().with_ingress(
            spec(SocketPattern::Router, SocketRole::Bind, &address).with_filter(SourceFilter::prefix("cam")),
        ),
        fast_config().with_egress(spec(SocketPattern::Dealer, SocketRole::Connect, &address)),
    )
    .await;

    assert!(sender.publish(&frame("cam1", 1)).await.unwrap().is_confirmed());
    assert!(sender.publish(&frame("cam-main", 1)).await.unwrap().is_confirmed());
    assert!(matches!(sender.publish(&frame("doorbell", 1)).await, Err(TransportError::Rejected { .. })));

    assert_eq!(receiver.list_sources(), BTreeSet::from(["cam-main".to_string(), "cam1".to_string()]));
    let endpoint = receiver.metrics().endpoint(&address).cloned().unwrap();
    assert_eq!(endpoint.filter_rejections, 1);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn drop_oldest_lane_keeps_the_newest_frames() {
    let address = inproc("drop");
    let (receiver, sender) = pair(
        fast_config()
            .with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address).with_queue_max_size(2).with_admission(
                AdmissionPolicy::DropOldest,
            )),
        fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Connect, &address)),
    )
    .await;

    for id in 1..=5 {
        sender.publish(&frame("cam1", id)).await.unwrap();
    }
    wait_until(|| receiver.metrics().lane("cam1").is_some_and(|lane| lane.admitted == 5)).await;

    let lane = receiver.metrics().lane("cam1").cloned().unwrap();
    assert_eq!(lane.depth, 2);
    assert_eq!(lane.dropped, 3);
    assert_eq!(collect(&receiver, "cam1", 2).await, vec![4, 5]);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn blocking_lane_stalls_the_producer_until_consumed() {
    let address = inproc("block");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address).with_queue_max_size(2)),
        fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Connect, &address)),
    )
    .await;

    for id in 1..=5 {
        sender.publish(&frame("cam1", id)).await.unwrap();
    }
    wait_until(|| receiver.metrics().lane("cam1").is_some_and(|lane| lane.blocked > 0)).await;
    let lane = receiver.metrics().lane("cam1").cloned().unwrap();
    assert_eq!(lane.depth, 2);
    assert_eq!(lane.dropped, 0);

    assert_eq!(collect(&receiver, "cam1", 5).await, vec![1, 2, 3, 4, 5]);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn a_stalled_lane_does_not_delay_other_sources() {
    let address = inproc("isolation");
    let receiver = TransportSupervisor::start(
        fast_config().with_ingress(spec(SocketPattern::Router, SocketRole::Bind, &address).with_queue_max_size(1)),
    )
    .await
    .unwrap();
    let context = receiver.context().clone();
    let dealer = || fast_config().with_egress(spec(SocketPattern::Dealer, SocketRole::Connect, &address));
    let stalled = Arc::new(TransportSupervisor::start_with_context(dealer(), context.clone()).await.unwrap());
    let healthy = TransportSupervisor::start_with_context(dealer(), context).await.unwrap();

    stalled.publish(&frame("cam-a", 1)).await.unwrap();
    let blocked = {
        let stalled = Arc::clone(&stalled);
        tokio::spawn(async move { stalled.publish(&frame("cam-a", 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "second frame waits for space in lane cam-a");

    let started = tokio::time::Instant::now();
    assert!(healthy.publish(&frame("cam-b", 1)).await.unwrap().is_confirmed());
    assert_eq!(receiver.poll("cam-b", WAIT).await.unwrap().unwrap().frame_id(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(collect(&receiver, "cam-a", 2).await, vec![1, 2]);
    assert!(blocked.await.unwrap().unwrap().is_confirmed());

    healthy.shutdown().await;
    stalled.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn one_dealer_keeps_confirming_a_source_while_another_waits() {
    let address = inproc("dealer-lanes");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Router, SocketRole::Bind, &address).with_queue_max_size(1)),
        fast_config().with_egress(spec(SocketPattern::Dealer, SocketRole::Connect, &address)),
    )
    .await;
    let sender = Arc::new(sender);

    assert!(sender.publish(&frame("cam-a", 1)).await.unwrap().is_confirmed());
    let blocked = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move { sender.publish(&frame("cam-a", 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "cam-a waits for its lane to empty");

    let started = tokio::time::Instant::now();
    assert!(sender.publish(&frame("cam-b", 1)).await.unwrap().is_confirmed());
    assert_eq!(receiver.poll("cam-b", WAIT).await.unwrap().unwrap().frame_id(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(collect(&receiver, "cam-a", 2).await, vec![1, 2]);
    assert!(blocked.await.unwrap().unwrap().is_confirmed());

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn one_pusher_keeps_delivering_a_source_while_another_waits() {
    let address = inproc("push-lanes");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address).with_queue_max_size(1)),
        fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Connect, &address)),
    )
    .await;

    for id in 1..=3 {
        assert_eq!(sender.publish(&frame("cam-a", id)).await.unwrap(), Ack::Queued);
    }
    sender.publish(&frame("cam-b", 1)).await.unwrap();

    let got = receiver.poll("cam-b", WAIT).await.unwrap().expect("cam-b is not held behind cam-a");
    assert_eq!(got.frame_id(), 1);
    assert_eq!(collect(&receiver, "cam-a", 3).await, vec![1, 2, 3]);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn end_of_stream_lets_a_restarted_source_begin_again() {
    let address = inproc("eos");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Router, SocketRole::Bind, &address)),
        fast_config().with_egress(spec(SocketPattern::Dealer, SocketRole::Connect, &address)),
    )
    .await;
    let mut events = receiver.events();

    sender.publish(&frame("cam1", 500)).await.unwrap();
    sender.publish_end_of_stream("cam1").await.unwrap();
    assert_eq!(sender.publish(&frame("cam1", 1)).await.unwrap(), Ack::Confirmed(AckStatus::Admitted));
    assert_eq!(collect(&receiver, "cam1", 2).await, vec![500, 1]);

    let mut saw_end = false;
    while let Ok(event) = events.try_recv() {
        if let HealthEvent::LaneEnded { source_id, .. } = event {
            saw_end |= source_id == "cam1";
        }
    }
    assert!(saw_end);

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn shutdown_wakes_every_blocked_consumer() {
    let address = inproc("wake");
    let receiver = Arc::new(
        TransportSupervisor::start(fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address)))
            .await
            .unwrap(),
    );

    let waiters: Vec<_> = ["cam1", "cam2", "cam3"]
        .into_iter()
        .map(|source| {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.poll(source, Duration::from_secs(60)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    receiver.shutdown_handle().trigger();
    for waiter in waiters {
        let result = tokio::time::timeout(WAIT, waiter).await.expect("woken promptly").unwrap();
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }
}

#[tokio::test]
async fn lane_stream_yields_frames_and_ends_at_shutdown() {
    let address = inproc("stream");
    let (receiver, sender) = pair(
        fast_config().with_ingress(spec(SocketPattern::Pull, SocketRole::Bind, &address)),
        fast_config().with_egress(spec(SocketPattern::Push, SocketRole::Connect, &address)),
    )
    .await;

    let mut frames = Box::pin(receiver.lane_stream("cam1"));
    for id in 1..=2 {
        sender.publish(&frame("cam1", id)).await.unwrap();
    }
    assert_eq!(frames.next().await.unwrap().frame_id(), 1);
    assert_eq!(frames.next().await.unwrap().frame_id(), 2);

    receiver.shutdown().await;
    assert!(tokio::time::timeout(WAIT, frames.next()).await.unwrap().is_none());
    sender.shutdown().await;
}
