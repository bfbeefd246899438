//! Offer/answer negotiation of the single pre-agreed data channel.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

use super::sdp::{decode_sdp, encode_sdp};
use super::{PeerError, PeerTransport, WebRtcPeer, DATA_CHANNEL_ID, DATA_CHANNEL_LABEL};
use crate::call_queue::{CallAnswer, IceCandidate, OfferHandle, OfferSignaler, QueueError};
use crate::config::PeerOptions;

async fn new_peer_connection(
    options: &PeerOptions,
) -> Result<(Arc<RTCPeerConnection>, Arc<RTCDataChannel>), PeerError> {
    let api = APIBuilder::new().build();
    let peer_connection = Arc::new(api.new_peer_connection(options.rtc_configuration()).await?);
    let init = RTCDataChannelInit {
        ordered: Some(true),
        negotiated: Some(DATA_CHANNEL_ID),
        ..Default::default()
    };
    let data_channel = match peer_connection
        .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
        .await
    {
        Ok(data_channel) => data_channel,
        Err(err) => {
            let _ = peer_connection.close().await;
            return Err(err.into());
        }
    };
    Ok((peer_connection, data_channel))
}

fn queue_error(err: QueueError) -> PeerError {
    match err {
        QueueError::Cancelled => PeerError::Cancelled,
        QueueError::DeadlineExceeded => PeerError::DeadlineExceeded,
        QueueError::Answerer(message) => PeerError::Rejected(message),
        other => PeerError::Queue(other),
    }
}

/// Caller side: offers a connection to `host` through `signaler` and returns
/// the peer once the answerer has finished. The data channel may still be
/// opening when this returns.
pub async fn connect_client(
    options: &PeerOptions,
    signaler: &dyn OfferSignaler,
    host: &str,
    cancel: &CancellationToken,
) -> Result<Arc<WebRtcPeer>, PeerError> {
    let (peer_connection, data_channel) = new_peer_connection(options).await?;
    let peer = WebRtcPeer::new(peer_connection.clone(), data_channel);
    match negotiate_client(&peer_connection, options, signaler, host, cancel).await {
        Ok(()) => Ok(peer),
        Err(err) => {
            peer.close().await;
            Err(err)
        }
    }
}

async fn negotiate_client(
    peer_connection: &Arc<RTCPeerConnection>,
    options: &PeerOptions,
    signaler: &dyn OfferSignaler,
    host: &str,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    let trickle = !options.disable_trickle && signaler.supports_trickle();
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Option<IceCandidate>>();
    if trickle {
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        let _ = local_tx.send(Some(init.into()));
                    }
                    Err(err) => {
                        warn!(target: "webrtc", error = %err, "dropping unserializable local candidate");
                    }
                },
                None => {
                    let _ = local_tx.send(None);
                }
            }
            Box::pin(async {})
        }));
    }

    let offer = peer_connection.create_offer(None).await?;
    if trickle {
        peer_connection.set_local_description(offer).await?;
    } else {
        let mut gathered = peer_connection.gathering_complete_promise().await;
        peer_connection.set_local_description(offer).await?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            _ = tokio::time::sleep(options.gather_timeout) => return Err(PeerError::DeadlineExceeded),
            _ = gathered.recv() => {}
        }
    }
    let local = peer_connection
        .local_description()
        .await
        .ok_or(PeerError::NoLocalDescription)?;
    let encoded = encode_sdp(&local)?;

    let mut handle = signaler
        .send_offer_init(host, &encoded, !trickle, cancel)
        .await
        .map_err(queue_error)?;
    let uuid = handle.uuid().to_string();
    debug!(target: "webrtc", %host, %uuid, trickle, "offer sent");

    let result = exchange_answers(
        peer_connection,
        signaler,
        host,
        &mut handle,
        trickle.then_some(&mut local_rx),
        cancel,
    )
    .await;
    // a signaler without trickle has already finished the exchange
    if let (Err(err), true) = (&result, signaler.supports_trickle()) {
        if let Err(report_err) = signaler.send_offer_error(host, &uuid, &err.to_string()).await {
            debug!(target: "webrtc", %uuid, error = %report_err, "could not report offer failure");
        }
    }
    result
}

async fn exchange_answers(
    peer_connection: &Arc<RTCPeerConnection>,
    signaler: &dyn OfferSignaler,
    host: &str,
    handle: &mut OfferHandle,
    mut local_candidates: Option<&mut mpsc::UnboundedReceiver<Option<IceCandidate>>>,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    let uuid = handle.uuid().to_string();
    let deadline = handle.deadline();
    // without trickle the initial offer already declared the caller done
    let mut caller_done = local_candidates.is_none();
    let mut gathering_done = local_candidates.is_none();
    let mut remote_applied = false;
    let mut answerer_finished = false;
    let mut pending: Vec<IceCandidate> = Vec::new();

    while !(answerer_finished && caller_done) {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            _ = sleep_until(deadline) => return Err(PeerError::DeadlineExceeded),
            local = recv_local(&mut local_candidates), if !gathering_done => match local {
                Some(candidate) => pending.push(candidate),
                None => gathering_done = true,
            },
            answer = handle.next_answer(), if !answerer_finished => match answer.map_err(queue_error)? {
                Some(CallAnswer::Init(sdp)) => {
                    peer_connection.set_remote_description(decode_sdp(&sdp)?).await?;
                    remote_applied = true;
                }
                Some(CallAnswer::Candidate(candidate)) => {
                    if let Err(err) = peer_connection.add_ice_candidate(candidate.into()).await {
                        warn!(target: "webrtc", %uuid, error = %err, "failed to add remote candidate");
                    }
                }
                Some(CallAnswer::Error(message)) => return Err(PeerError::Rejected(message)),
                None => {
                    if !remote_applied {
                        return Err(PeerError::Rejected(
                            "answerer finished without an answer".into(),
                        ));
                    }
                    answerer_finished = true;
                }
            },
        }

        // local candidates wait for the remote description
        if remote_applied {
            for candidate in pending.drain(..) {
                signaler
                    .send_offer_update(host, &uuid, candidate)
                    .await
                    .map_err(queue_error)?;
            }
            if gathering_done && !caller_done {
                signaler
                    .send_offer_done(host, &uuid)
                    .await
                    .map_err(queue_error)?;
                caller_done = true;
            }
        }
    }
    debug!(target: "webrtc", %uuid, "offer exchange complete");
    Ok(())
}

async fn recv_local(
    candidates: &mut Option<&mut mpsc::UnboundedReceiver<Option<IceCandidate>>>,
) -> Option<IceCandidate> {
    match candidates {
        Some(rx) => rx.recv().await.flatten(),
        None => None,
    }
}

/// Answerer side: applies the caller's offer, feeds caller candidates into
/// the connection and returns the peer with the fully gathered local answer.
pub async fn accept_offer(
    options: &PeerOptions,
    remote_sdp: &str,
    mut caller_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    cancel: &CancellationToken,
) -> Result<(Arc<WebRtcPeer>, String), PeerError> {
    let remote = decode_sdp(remote_sdp)?;
    let (peer_connection, data_channel) = new_peer_connection(options).await?;
    let peer = WebRtcPeer::new(peer_connection.clone(), data_channel);

    let answered = async {
        peer_connection.set_remote_description(remote).await?;
        let answer = peer_connection.create_answer(None).await?;
        let mut gathered = peer_connection.gathering_complete_promise().await;
        peer_connection.set_local_description(answer).await?;
        let mut candidates_open = true;
        let gather_deadline = tokio::time::Instant::now() + options.gather_timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                _ = sleep_until(gather_deadline) => return Err(PeerError::DeadlineExceeded),
                _ = gathered.recv() => break,
                candidate = caller_candidates.recv(), if candidates_open => match candidate {
                    Some(candidate) => add_remote_candidate(&peer_connection, candidate).await,
                    None => candidates_open = false,
                },
            }
        }
        let local = peer_connection
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;
        encode_sdp(&local)
    }
    .await;

    match answered {
        Ok(sdp) => {
            let weak = Arc::downgrade(&peer_connection);
            tokio::spawn(drain_late_candidates(weak, caller_candidates));
            Ok((peer, sdp))
        }
        Err(err) => {
            peer.close().await;
            Err(err)
        }
    }
}

async fn add_remote_candidate(peer_connection: &RTCPeerConnection, candidate: IceCandidate) {
    if let Err(err) = peer_connection.add_ice_candidate(candidate.into()).await {
        warn!(target: "webrtc", error = %err, "failed to add caller candidate");
    }
}

async fn drain_late_candidates(
    peer_connection: Weak<RTCPeerConnection>,
    mut caller_candidates: mpsc::UnboundedReceiver<IceCandidate>,
) {
    while let Some(candidate) = caller_candidates.recv().await {
        let Some(peer_connection) = peer_connection.upgrade() else {
            break;
        };
        add_remote_candidate(&peer_connection, candidate).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webrtc::ice_transport::ice_server::RTCIceServer;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    use super::*;

    async fn local_offer() -> String {
        let (peer_connection, _data_channel) = new_peer_connection(&PeerOptions::localhost())
            .await
            .unwrap();
        let offer = peer_connection.create_offer(None).await.unwrap();
        peer_connection.set_local_description(offer).await.unwrap();
        let local = peer_connection.local_description().await.unwrap();
        let encoded = encode_sdp(&local).unwrap();
        peer_connection.close().await.unwrap();
        encoded
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn answer_gathering_gives_up_at_its_timeout() {
        let offer = local_offer().await;
        // a STUN server that never replies keeps srflx gathering open
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let options = PeerOptions::localhost()
            .with_ice_servers(vec![RTCIceServer {
                urls: vec![format!("stun:{}", silent.local_addr().unwrap())],
                ..Default::default()
            }])
            .with_gather_timeout(Duration::from_millis(200));

        let (_tx, candidates) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let result = accept_offer(&options, &offer, candidates, &cancel).await;
        assert!(matches!(result, Err(PeerError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn answer_is_returned_once_gathering_completes() {
        let offer = local_offer().await;
        let (_tx, candidates) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (peer, answer) = accept_offer(&PeerOptions::localhost(), &offer, candidates, &cancel)
            .await
            .unwrap();
        assert_eq!(decode_sdp(&answer).unwrap().sdp_type, RTCSdpType::Answer);
        peer.close().await;
    }
}
