use libp2p::request_response::ResponseChannel;
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use strata_shared::protocol::{NodeAnnouncement, NodeRequest, NodeResponse};

use crate::error::NetError;
use crate::swarm::SwarmCommand;

/// Send a request through the swarm task and wait for the peer's answer.
///
/// The swarm enforces the configured request timeout and reports it as
/// [`NetError::Timeout`].
pub async fn send_request(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    peer: PeerId,
    request: NodeRequest,
) -> Result<NodeResponse, NetError> {
    let (reply, rx) = oneshot::channel();
    debug!(peer = %peer, cid = %request.cid(), "Sending request");

    cmd_tx
        .send(SwarmCommand::SendRequest { peer, request, reply })
        .await
        .map_err(|_| NetError::ChannelClosed)?;

    rx.await.map_err(|_| NetError::ChannelClosed)?
}

pub async fn respond(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    channel: ResponseChannel<NodeResponse>,
    response: NodeResponse,
) -> Result<(), NetError> {
    cmd_tx
        .send(SwarmCommand::Respond { channel, response })
        .await
        .map_err(|_| NetError::ChannelClosed)
}

pub async fn publish_announcement(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    announcement: NodeAnnouncement,
) -> Result<(), NetError> {
    debug!(
        ranges = announcement.shard_ranges.len(),
        "Publishing shard announcement"
    );
    cmd_tx
        .send(SwarmCommand::Announce(announcement))
        .await
        .map_err(|_| NetError::ChannelClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_shared::Cid;

    #[tokio::test]
    async fn test_send_request_round_trips_through_command_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let peer = PeerId::random();
        let cid = Cid::of(b"fetch me");

        let responder = tokio::spawn(async move {
            match rx.recv().await {
                Some(SwarmCommand::SendRequest { peer: to, request, reply }) => {
                    assert_eq!(to, peer);
                    assert_eq!(*request.cid(), cid);
                    let _ = reply.send(Ok(NodeResponse::NotFound { cid }));
                }
                other => panic!("unexpected command: {other:?}"),
            }
        });

        let response = send_request(&tx, peer, NodeRequest::Fetch { cid }).await.unwrap();
        assert!(matches!(response, NodeResponse::NotFound { .. }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (tx, rx) = mpsc::channel::<SwarmCommand>(1);
        drop(rx);
        let result = send_request(&tx, PeerId::random(), NodeRequest::Fetch { cid: Cid::of(b"x") }).await;
        assert!(matches!(result, Err(NetError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropped_reply_reports_error() {
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // Swallow the reply sender without answering.
            let _ = rx.recv().await;
        });
        let result = send_request(&tx, PeerId::random(), NodeRequest::Fetch { cid: Cid::of(b"y") }).await;
        assert!(matches!(result, Err(NetError::ChannelClosed)));
    }
}
