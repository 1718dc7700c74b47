// Integration tests for room forwarding
//
// Every participant is an in-process pipe, so these tests exercise the
// complete path through the registry and router:
// - Track fan-out, newcomer bootstrap and teardown
// - RTP forwarding and retransmission from the jitter buffer
// - REMB aggregation and PLI routing towards publishers
// - Data message broadcast
// - Room lifecycle and limits

use bytes::Bytes;
use roomcast_sfu::jitter::{add_blp, packet_list};
use roomcast_sfu::{
    ClientId, Error, PipeEvent, PipeRemote, PipeTransport, RoomId, RoomRegistry, SfuConfig,
    SimpleTrack, Track, TrackId, TrackKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

const ROOM: &str = "room";
const WAIT: Duration = Duration::from_secs(2);

fn video_track(id: &str, ssrc: u32) -> Arc<dyn Track> {
    Arc::new(SimpleTrack::new(
        TrackId::from(id),
        format!("{id}-stream"),
        ssrc,
        96,
        RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
    ))
}

fn rtp(ssrc: u32, seq: u16) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 3000 * u32::from(seq),
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(vec![0xab; 10]),
    }
}

fn remb(ssrcs: Vec<u32>, bitrate: f32) -> Box<ReceiverEstimatedMaximumBitrate> {
    Box::new(ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0,
        bitrate,
        ssrcs,
    })
}

async fn join(registry: &Arc<RoomRegistry>, room: &str, client: &str) -> PipeRemote {
    let (transport, remote) = PipeTransport::new(ClientId::from(client));
    registry
        .add(RoomId::from(room), transport)
        .await
        .expect("join room");
    remote
}

async fn next_event(remote: &mut PipeRemote) -> PipeEvent {
    timeout(WAIT, remote.recv())
        .await
        .expect("timed out waiting for event")
        .expect("pipe closed")
}

async fn assert_quiet(remote: &mut PipeRemote) {
    sleep(Duration::from_millis(50)).await;
    if let Some(event) = remote.try_recv() {
        panic!("{} received unexpected {}", remote.client_id(), event.kind());
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn expect_track_added(remote: &mut PipeRemote) -> Arc<dyn Track> {
    match next_event(remote).await {
        PipeEvent::TrackAdded(track) => track,
        other => panic!("expected track_added, got {}", other.kind()),
    }
}

async fn expect_rtp(remote: &mut PipeRemote) -> Packet {
    match next_event(remote).await {
        PipeEvent::Rtp(packet) => packet,
        other => panic!("expected rtp, got {}", other.kind()),
    }
}

async fn expect_remb_bitrate(remote: &mut PipeRemote) -> f32 {
    match next_event(remote).await {
        PipeEvent::Rtcp(packets) => {
            assert_eq!(packets.len(), 1);
            packets[0]
                .as_any()
                .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
                .expect("REMB")
                .bitrate
        }
        other => panic!("expected rtcp, got {}", other.kind()),
    }
}

async fn expect_nack(remote: &mut PipeRemote) -> TransportLayerNack {
    match next_event(remote).await {
        PipeEvent::Rtcp(packets) => {
            assert_eq!(packets.len(), 1);
            packets[0]
                .as_any()
                .downcast_ref::<TransportLayerNack>()
                .expect("NACK")
                .clone()
        }
        other => panic!("expected rtcp, got {}", other.kind()),
    }
}

/// A publishes while B and C are in the room, then A leaves
#[tokio::test]
async fn test_publish_and_leave_fan_out() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;
    let mut c = join(&registry, ROOM, "c").await;

    a.publish(video_track("a-video", 1000)).await.unwrap();

    for subscriber in [&mut b, &mut c] {
        let track = expect_track_added(subscriber).await;
        assert_eq!(track.ssrc(), 1000);
        assert_eq!(track.kind(), TrackKind::Video);
        let identity = track.identity().expect("publisher identity");
        assert_eq!(identity.client_id, ClientId::from("a"));
        assert_eq!(identity.room_id, RoomId::from(ROOM));
    }

    a.close().await;

    for subscriber in [&mut b, &mut c] {
        match next_event(subscriber).await {
            PipeEvent::TrackRemoved(track_id) => assert_eq!(track_id, TrackId::from("a-video")),
            other => panic!("expected track_removed, got {}", other.kind()),
        }
    }

    let router = registry.router(&RoomId::from(ROOM)).expect("room still active");
    eventually("a to leave", || router.transport_count() == 2).await;
    assert_eq!(router.publication_count(), 0);

    // Feedback for the departed publisher has nowhere to go
    b.send_rtcp(remb(vec![1000], 250_000.0)).await.unwrap();
    assert_quiet(&mut b).await;
    assert_quiet(&mut c).await;
    assert_eq!(router.stats().rtcp_packets_forwarded, 0);
    assert_eq!(router.stats().delivery_failures, 0);
}

#[tokio::test]
async fn test_rtp_reaches_every_other_member() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;
    let mut c = join(&registry, ROOM, "c").await;

    a.publish(video_track("a-video", 7)).await.unwrap();
    expect_track_added(&mut b).await;
    expect_track_added(&mut c).await;

    for seq in 0..3 {
        a.send_rtp(rtp(7, seq)).await.unwrap();
    }

    for subscriber in [&mut b, &mut c] {
        for seq in 0..3 {
            assert_eq!(expect_rtp(subscriber).await, rtp(7, seq));
        }
    }
    assert_quiet(&mut a).await;

    let router = registry.router(&RoomId::from(ROOM)).unwrap();
    eventually("forwarding counters", || router.stats().rtp_packets_forwarded == 6).await;
    assert_eq!(router.stats().rtp_bytes_forwarded, 60);
}

#[tokio::test]
async fn test_rtp_is_only_forwarded_for_own_publications() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 3)).await.unwrap();
    expect_track_added(&mut b).await;
    b.publish(video_track("b-video", 4)).await.unwrap();
    expect_track_added(&mut a).await;

    // Never published, and published by somebody else
    a.send_rtp(rtp(99, 1)).await.unwrap();
    a.send_rtp(rtp(4, 1)).await.unwrap();
    a.send_rtp(rtp(3, 1)).await.unwrap();

    assert_eq!(expect_rtp(&mut b).await, rtp(3, 1));
    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;

    // Nothing was buffered for the stray streams
    b.send_rtcp(Box::new(TransportLayerNack {
        sender_ssrc: 0,
        media_ssrc: 99,
        nacks: vec![NackPair {
            packet_id: 1,
            lost_packets: 0,
        }],
    }))
    .await
    .unwrap();
    assert_quiet(&mut b).await;

    let stats = registry.router(&RoomId::from(ROOM)).unwrap().stats();
    assert_eq!(stats.rtp_packets_forwarded, 1);
    assert_eq!(stats.packets_retransmitted, 0);
}

#[tokio::test]
async fn test_gap_in_published_stream_is_nacked_upstream() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 111)).await.unwrap();
    expect_track_added(&mut b).await;

    for seq in (0..=16).filter(|seq| *seq != 2) {
        a.send_rtp(rtp(111, seq)).await.unwrap();
    }

    let nack = expect_nack(&mut a).await;
    assert_eq!(nack.media_ssrc, 111);
    assert_eq!(nack.nacks.len(), 1);
    assert_eq!(packet_list(&nack.nacks[0]), vec![2]);

    for _ in 0..16 {
        expect_rtp(&mut b).await;
    }
    assert_eq!(registry.router(&RoomId::from(ROOM)).unwrap().stats().self_nacks_sent, 1);
}

#[tokio::test]
async fn test_nack_is_answered_from_buffer() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 5)).await.unwrap();
    expect_track_added(&mut b).await;

    for seq in 10..13 {
        a.send_rtp(rtp(5, seq)).await.unwrap();
    }
    for _ in 10..13 {
        expect_rtp(&mut b).await;
    }

    // 11 is buffered, 13 never arrived
    b.send_rtcp(Box::new(TransportLayerNack {
        sender_ssrc: 0,
        media_ssrc: 5,
        nacks: vec![NackPair {
            packet_id: 11,
            lost_packets: add_blp(11, 13, 0),
        }],
    }))
    .await
    .unwrap();

    assert_eq!(expect_rtp(&mut b).await, rtp(5, 11));

    let residual = expect_nack(&mut a).await;
    assert_eq!(residual.media_ssrc, 5);
    let lost: Vec<u16> = residual.nacks.iter().flat_map(packet_list).collect();
    assert_eq!(lost, vec![13]);

    let stats = registry.router(&RoomId::from(ROOM)).unwrap().stats();
    assert_eq!(stats.nacks_received, 1);
    assert_eq!(stats.packets_retransmitted, 1);
}

#[tokio::test]
async fn test_nacks_are_dropped_without_jitter_buffer() {
    let config = SfuConfig {
        jitter_buffer_enabled: false,
        ..Default::default()
    };
    let registry = RoomRegistry::new(config);
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 5)).await.unwrap();
    expect_track_added(&mut b).await;

    for seq in (0..=16).filter(|seq| *seq != 2) {
        a.send_rtp(rtp(5, seq)).await.unwrap();
    }
    for _ in 0..16 {
        expect_rtp(&mut b).await;
    }

    b.send_rtcp(Box::new(TransportLayerNack {
        sender_ssrc: 0,
        media_ssrc: 5,
        nacks: vec![NackPair {
            packet_id: 2,
            lost_packets: 0,
        }],
    }))
    .await
    .unwrap();

    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;
    let stats = registry.router(&RoomId::from(ROOM)).unwrap().stats();
    assert_eq!(stats.self_nacks_sent, 0);
    assert_eq!(stats.packets_retransmitted, 0);
}

#[tokio::test]
async fn test_picture_loss_goes_to_publisher() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 42)).await.unwrap();
    expect_track_added(&mut b).await;

    // Unknown SSRC first: dropped
    b.send_rtcp(Box::new(PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc: 9,
    }))
    .await
    .unwrap();
    b.send_rtcp(Box::new(PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc: 42,
    }))
    .await
    .unwrap();

    match next_event(&mut a).await {
        PipeEvent::Rtcp(packets) => {
            let pli = packets[0]
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .expect("PLI");
            assert_eq!(pli.media_ssrc, 42);
        }
        other => panic!("expected rtcp, got {}", other.kind()),
    }
    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;
}

#[tokio::test]
async fn test_remb_bound_is_minimum_across_subscribers() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;
    let mut c = join(&registry, ROOM, "c").await;

    a.publish(video_track("a-video", 123)).await.unwrap();
    expect_track_added(&mut b).await;
    expect_track_added(&mut c).await;

    b.send_rtcp(remb(vec![123], 1000.0)).await.unwrap();
    assert_eq!(expect_remb_bitrate(&mut a).await, 1000.0);

    c.send_rtcp(remb(vec![123], 900.0)).await.unwrap();
    assert_eq!(expect_remb_bitrate(&mut a).await, 900.0);

    b.send_rtcp(remb(vec![123], 1100.0)).await.unwrap();
    assert_eq!(expect_remb_bitrate(&mut a).await, 900.0);

    // SSRCs nobody publishes are ignored
    b.send_rtcp(remb(vec![123, 999], 1200.0)).await.unwrap();
    assert_eq!(expect_remb_bitrate(&mut a).await, 900.0);

    assert_quiet(&mut b).await;
    assert_quiet(&mut c).await;
}

#[tokio::test]
async fn test_data_messages_are_broadcast() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;
    let mut c = join(&registry, ROOM, "c").await;

    a.send_message(DataChannelMessage {
        is_string: true,
        data: Bytes::from_static(b"hello"),
    })
    .await
    .unwrap();

    for subscriber in [&mut b, &mut c] {
        match next_event(subscriber).await {
            PipeEvent::Message(message) => {
                assert!(message.is_string);
                assert_eq!(message.data, Bytes::from_static(b"hello"));
            }
            other => panic!("expected message, got {}", other.kind()),
        }
    }
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_broken_destination_does_not_stop_delivery() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;
    let c = join(&registry, ROOM, "c").await;

    // C's client side goes away without the transport closing
    drop(c);

    a.publish(video_track("a-video", 3)).await.unwrap();
    expect_track_added(&mut b).await;

    for seq in 0..5 {
        a.send_rtp(rtp(3, seq)).await.unwrap();
    }
    for seq in 0..5 {
        assert_eq!(expect_rtp(&mut b).await.header.sequence_number, seq);
    }

    let router = registry.router(&RoomId::from(ROOM)).unwrap();
    eventually("failed writes to c", || router.stats().delivery_failures >= 6).await;
    assert_eq!(router.transport_count(), 3);
}

#[tokio::test]
async fn test_newcomer_receives_existing_tracks() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    a.publish(video_track("a-video", 10)).await.unwrap();
    a.publish(video_track("a-screen", 11)).await.unwrap();

    let router = registry.router(&RoomId::from(ROOM)).unwrap();
    eventually("a's tracks to be published", || router.publication_count() == 2).await;

    let mut b = join(&registry, ROOM, "b").await;
    let mut ssrcs = vec![
        expect_track_added(&mut b).await.ssrc(),
        expect_track_added(&mut b).await.ssrc(),
    ];
    ssrcs.sort_unstable();
    assert_eq!(ssrcs, vec![10, 11]);
    assert_quiet(&mut b).await;

    // Bootstrap only goes one way
    assert_quiet(&mut a).await;

    let metadata = registry
        .get_tracks_metadata(&RoomId::from(ROOM), &ClientId::from("b"))
        .await
        .expect("b is in the room");
    assert_eq!(metadata.len(), 2);
    assert!(metadata
        .iter()
        .all(|entry| entry.user_id == Some(ClientId::from("a")) && entry.kind == TrackKind::Video));
    let mut mids: Vec<_> = metadata.iter().filter_map(|entry| entry.mid.clone()).collect();
    mids.sort();
    assert_eq!(mids, vec!["0".to_string(), "1".to_string()]);

    let metadata = registry
        .get_tracks_metadata(&RoomId::from(ROOM), &ClientId::from("a"))
        .await
        .expect("a is in the room");
    assert!(metadata.is_empty());
}

#[tokio::test]
async fn test_unpublish_removes_track_everywhere() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let mut a = join(&registry, ROOM, "a").await;
    let mut b = join(&registry, ROOM, "b").await;

    a.publish(video_track("a-video", 20)).await.unwrap();
    expect_track_added(&mut b).await;
    a.unpublish(&TrackId::from("a-video")).await.unwrap();

    match next_event(&mut b).await {
        PipeEvent::TrackRemoved(track_id) => assert_eq!(track_id, TrackId::from("a-video")),
        other => panic!("expected track_removed, got {}", other.kind()),
    }

    let router = registry.router(&RoomId::from(ROOM)).unwrap();
    assert_eq!(router.publication_count(), 0);
    let metadata = router.get_tracks_metadata(&ClientId::from("b")).await.unwrap();
    assert!(metadata.is_empty());
}

#[tokio::test]
async fn test_room_is_removed_when_last_member_leaves() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let a = join(&registry, ROOM, "a").await;
    let b = join(&registry, ROOM, "b").await;
    let _other = join(&registry, "other", "c").await;
    assert_eq!(registry.room_count(), 2);

    a.close().await;
    eventually("a to leave", || registry.stats().total_transports == 2).await;
    assert_eq!(registry.room_count(), 2);

    b.close().await;
    eventually("room to close", || registry.room_count() == 1).await;
    assert_eq!(registry.room_ids(), vec![RoomId::from("other")]);

    // The room comes back on the next join
    let _d = join(&registry, ROOM, "d").await;
    assert_eq!(registry.room_count(), 2);
}

#[tokio::test]
async fn test_room_and_transport_limits() {
    let config = SfuConfig {
        max_rooms: 1,
        max_transports_per_room: 2,
        ..Default::default()
    };
    let registry = RoomRegistry::new(config);
    let _a = join(&registry, ROOM, "a").await;
    let _b = join(&registry, ROOM, "b").await;

    let (transport, _remote) = PipeTransport::new(ClientId::from("c"));
    let err = registry.add(RoomId::from(ROOM), transport).await.unwrap_err();
    assert!(matches!(err, Error::RoomFull { limit: 2, .. }));

    let (transport, _remote) = PipeTransport::new(ClientId::from("d"));
    let err = registry.add(RoomId::from("second"), transport).await.unwrap_err();
    assert!(matches!(err, Error::RoomLimitReached(1)));

    let (transport, _remote) = PipeTransport::new(ClientId::from("a"));
    assert!(registry.add(RoomId::from(ROOM), transport).await.is_err());
    assert_eq!(registry.stats().total_transports, 2);
}

#[tokio::test]
async fn test_stats_serialize() {
    let registry = RoomRegistry::new(SfuConfig::default());
    let _a = join(&registry, ROOM, "a").await;

    let registry_stats = serde_json::to_value(registry.stats()).unwrap();
    assert_eq!(registry_stats["active_rooms"], 1);
    assert_eq!(registry_stats["total_transports"], 1);

    let router_stats = serde_json::to_value(registry.router(&RoomId::from(ROOM)).unwrap().stats()).unwrap();
    assert_eq!(router_stats["transports"], 1);
    assert_eq!(router_stats["rtp_packets_forwarded"], 0);
}
