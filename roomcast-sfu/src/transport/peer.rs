//! WebRTC peer transport
//!
//! Wraps an `RTCPeerConnection` that the signaling layer has already
//! negotiated. This module handles:
//! - Turning remote tracks into track events and an RTP stream
//! - Creating local tracks for media forwarded to the peer
//! - Collecting the peer's RTCP feedback about those local tracks, with the
//!   SSRCs of our senders mapped back to the publishers' SSRCs
//! - The data channel and connection teardown

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::{InboundStreams, LocalTrack, RtcpPacket, Transport, TransportStreams, EVENT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::track::{SimpleTrack, Track, TrackEvent, TrackMetadata};
use crate::types::{ClientId, TrackId};

struct SentTrack {
    /// SSRC of the sender, which is what the peer sees
    ssrc: u32,
    track: Arc<dyn Track>,
    local: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
}

/// Transport over a negotiated WebRTC peer connection
pub struct PeerTransport {
    client_id: ClientId,
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// Tracks sent to the peer, by track id
    sent: Mutex<HashMap<TrackId, SentTrack>>,
    /// Publisher SSRC behind each sender SSRC
    feedback_ssrcs: Arc<RwLock<HashMap<u32, u32>>>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    remote_tracks_rx: Mutex<Option<mpsc::Receiver<Arc<dyn Track>>>>,
    inbound: InboundStreams,
    done: CancellationToken,
}

impl PeerTransport {
    /// Attach to a peer connection. Handlers are installed right away, so
    /// this should happen before the remote description is applied.
    pub fn new(client_id: ClientId, peer_connection: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (remote_tracks_tx, remote_tracks_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (rtp_tx, rtp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (track_events_tx, track_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let data_channel = Arc::new(RwLock::new(None));
        let done = CancellationToken::new();

        Self::watch_remote_tracks(
            &peer_connection,
            client_id.clone(),
            remote_tracks_tx,
            rtp_tx,
            track_events_tx,
        );
        Self::watch_data_channel(&peer_connection, Arc::clone(&data_channel), messages_tx);
        Self::watch_connection_state(&peer_connection, client_id.clone(), done.clone());

        Arc::new(Self {
            client_id,
            peer_connection,
            data_channel,
            sent: Mutex::new(HashMap::new()),
            feedback_ssrcs: Arc::new(RwLock::new(HashMap::new())),
            rtcp_tx,
            remote_tracks_rx: Mutex::new(Some(remote_tracks_rx)),
            inbound: InboundStreams::new(rtp_rx, rtcp_rx, track_events_rx, messages_rx),
            done,
        })
    }

    /// Close the peer connection and fire `done`
    pub async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        self.done.cancel();
        Ok(())
    }

    fn watch_remote_tracks(
        peer_connection: &RTCPeerConnection,
        client_id: ClientId,
        remote_tracks_tx: mpsc::Sender<Arc<dyn Track>>,
        rtp_tx: mpsc::Sender<Packet>,
        track_events_tx: mpsc::Sender<TrackEvent>,
    ) {
        peer_connection.on_track(Box::new(move |remote: Arc<TrackRemote>, _receiver, _transceiver| {
            let client_id = client_id.clone();
            let remote_tracks_tx = remote_tracks_tx.clone();
            let rtp_tx = rtp_tx.clone();
            let track_events_tx = track_events_tx.clone();

            Box::pin(async move {
                let track: Arc<dyn Track> = Arc::new(SimpleTrack::from_remote(&remote));
                info!(
                    client_id = %client_id,
                    track_id = %track.id(),
                    ssrc = track.ssrc(),
                    codec = %track.codec().mime_type,
                    "Remote track started"
                );

                // Nobody has to listen for raw remote tracks
                let _ = remote_tracks_tx.try_send(Arc::clone(&track));
                if track_events_tx.send(TrackEvent::Added(Arc::clone(&track))).await.is_err() {
                    return;
                }

                tokio::spawn(async move {
                    loop {
                        match remote.read_rtp().await {
                            Ok((packet, _attributes)) => {
                                if rtp_tx.send(packet).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(
                                    client_id = %client_id,
                                    track_id = %track.id(),
                                    error = %e,
                                    "Remote track ended"
                                );
                                break;
                            }
                        }
                    }
                    let _ = track_events_tx.send(TrackEvent::Removed(track)).await;
                });
            })
        }));
    }

    fn watch_data_channel(
        peer_connection: &RTCPeerConnection,
        slot: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
        messages_tx: mpsc::Sender<DataChannelMessage>,
    ) {
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let messages_tx = messages_tx.clone();

            Box::pin(async move {
                channel.on_message(Box::new(move |message: DataChannelMessage| {
                    let messages_tx = messages_tx.clone();
                    Box::pin(async move {
                        let _ = messages_tx.send(message).await;
                    })
                }));
                *slot.write() = Some(channel);
            })
        }));
    }

    fn watch_connection_state(
        peer_connection: &RTCPeerConnection,
        client_id: ClientId,
        done: CancellationToken,
    ) {
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) && !done.is_cancelled()
                {
                    info!(client_id = %client_id, state = %state, "Peer connection ended");
                    done.cancel();
                }
                Box::pin(async {})
            },
        ));
    }

    fn local_for_ssrc(&self, ssrc: u32) -> Option<Arc<TrackLocalStaticRTP>> {
        self.sent
            .lock()
            .values()
            .find(|sent| sent.track.ssrc() == ssrc)
            .map(|sent| Arc::clone(&sent.local))
    }
}

#[async_trait]
impl Transport for PeerTransport {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn add_track(&self, track: Arc<dyn Track>) -> Result<LocalTrack> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec().clone(),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Packets leave with the sender's SSRC, not the publisher's
        let ssrc = sender
            .get_parameters()
            .await
            .encodings
            .first()
            .map_or(track.ssrc(), |encoding| encoding.ssrc);
        self.feedback_ssrcs.write().insert(ssrc, track.ssrc());

        // Feedback about the track (NACK, PLI, REMB) goes to the RTCP stream
        let reader = Arc::clone(&sender);
        let rtcp_tx = self.rtcp_tx.clone();
        let feedback_ssrcs = Arc::clone(&self.feedback_ssrcs);
        tokio::spawn(async move {
            while let Ok((packets, _attributes)) = reader.read_rtcp().await {
                for packet in packets {
                    let packet = translate_feedback(packet, &feedback_ssrcs.read());
                    if rtcp_tx.send(packet).await.is_err() {
                        return;
                    }
                }
            }
        });

        debug!(
            client_id = %self.client_id,
            track_id = %track.id(),
            source_ssrc = track.ssrc(),
            ssrc,
            "Sending track to peer"
        );

        let handle = LocalTrack {
            track_id: track.id().clone(),
            ssrc,
        };
        self.sent.lock().insert(
            track.id().clone(),
            SentTrack {
                ssrc,
                track,
                local,
                sender,
            },
        );
        Ok(handle)
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        let sent = self
            .sent
            .lock()
            .remove(track_id)
            .ok_or_else(|| Error::TrackNotFound(track_id.to_string()))?;
        self.feedback_ssrcs.write().remove(&sent.ssrc);
        self.peer_connection.remove_track(&sent.sender).await?;
        Ok(())
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<usize> {
        let local = self
            .local_for_ssrc(packet.header.ssrc)
            .ok_or_else(|| Error::TrackNotFound(format!("ssrc {}", packet.header.ssrc)))?;
        Ok(local.write_rtp(packet).await?)
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()> {
        self.peer_connection.write_rtcp(packets).await?;
        Ok(())
    }

    async fn send(&self, message: DataChannelMessage) -> Result<()> {
        let channel = self
            .data_channel
            .read()
            .clone()
            .ok_or_else(|| Error::DataChannelNotReady(self.client_id.clone()))?;

        if message.is_string {
            let text = String::from_utf8_lossy(&message.data).into_owned();
            channel.send_text(text).await?;
        } else {
            channel.send(&message.data).await?;
        }
        Ok(())
    }

    fn take_remote_tracks(&self) -> Option<mpsc::Receiver<Arc<dyn Track>>> {
        self.remote_tracks_rx.lock().take()
    }

    fn take_rtp(&self) -> Option<mpsc::Receiver<Packet>> {
        self.inbound.take_rtp()
    }

    fn take_rtcp(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.inbound.take_rtcp()
    }

    fn take_track_events(&self) -> Option<mpsc::Receiver<TrackEvent>> {
        self.inbound.take_track_events()
    }

    fn take_messages(&self) -> Option<mpsc::Receiver<DataChannelMessage>> {
        self.inbound.take_messages()
    }

    fn take_streams(&self) -> Option<TransportStreams> {
        self.inbound.take_all()
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    async fn tracks_metadata(&self) -> Vec<TrackMetadata> {
        let sent: Vec<(Arc<dyn Track>, Arc<RTCRtpSender>)> = self
            .sent
            .lock()
            .values()
            .map(|sent| (Arc::clone(&sent.track), Arc::clone(&sent.sender)))
            .collect();

        let transceivers = self.peer_connection.get_transceivers().await;
        let mut metadata = Vec::with_capacity(sent.len());
        for (track, sender) in sent {
            let mut mid = None;
            for transceiver in &transceivers {
                if Arc::ptr_eq(&transceiver.sender().await, &sender) {
                    mid = transceiver.mid().map(|mid| mid.to_string());
                    break;
                }
            }
            metadata.push(TrackMetadata::from_track(track.as_ref(), mid));
        }
        metadata
    }
}

/// Point feedback about a sender at the publisher SSRC it forwards.
///
/// PLI and NACK carry one media SSRC; REMB lists several. Other packets and
/// SSRCs without a mapping pass through unchanged.
fn translate_feedback(packet: RtcpPacket, sources: &HashMap<u32, u32>) -> RtcpPacket {
    let source = |ssrc: u32| sources.get(&ssrc).copied().unwrap_or(ssrc);

    let translated: Option<RtcpPacket> = {
        let any = packet.as_any();
        if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            Some(Box::new(PictureLossIndication {
                media_ssrc: source(pli.media_ssrc),
                ..pli.clone()
            }))
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            Some(Box::new(TransportLayerNack {
                media_ssrc: source(nack.media_ssrc),
                ..nack.clone()
            }))
        } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            Some(Box::new(ReceiverEstimatedMaximumBitrate {
                ssrcs: remb.ssrcs.iter().map(|ssrc| source(*ssrc)).collect(),
                ..remb.clone()
            }))
        } else {
            None
        }
    };

    translated.unwrap_or(packet)
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        debug!(
            client_id = %self.client_id,
            sent_tracks = self.sent.lock().len(),
            "PeerTransport dropped"
        );
    }
}
