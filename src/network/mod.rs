//! Channel plumbing between the engine and the (external) network layer.
//!
//! Four bounded queues of capacity 100: general inbound, leader-priority
//! inbound, outbound, and a drain for messages rejected as invalid.

use tokio::sync::mpsc;

use crate::message::Message;

pub const QUEUE_CAPACITY: usize = 100;

/// An outbound message plus its delivery mode: point-to-point (data
/// responses and similar) or broadcast.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message: Message,
    pub peer_to_peer: bool,
}

impl OutboundMessage {
    pub fn broadcast(message: Message) -> Self {
        Self {
            message,
            peer_to_peer: false,
        }
    }

    pub fn direct(message: Message) -> Self {
        Self {
            message,
            peer_to_peer: true,
        }
    }
}

/// The engine's ends of the queues.
pub struct EngineChannels {
    pub in_queue: mpsc::Receiver<Message>,
    pub leader_in_queue: mpsc::Receiver<Message>,
    pub out_queue: mpsc::Sender<OutboundMessage>,
    pub invalid_queue: mpsc::Sender<Message>,
}

/// The network layer's ends of the queues.
pub struct NetworkHandle {
    pub in_queue: mpsc::Sender<Message>,
    pub leader_in_queue: mpsc::Sender<Message>,
    pub out_queue: mpsc::Receiver<OutboundMessage>,
    pub invalid_queue: mpsc::Receiver<Message>,
}

pub fn channel_pair(capacity: usize) -> (EngineChannels, NetworkHandle) {
    let capacity = capacity.max(1);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (leader_tx, leader_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (invalid_tx, invalid_rx) = mpsc::channel(capacity);
    (
        EngineChannels {
            in_queue: in_rx,
            leader_in_queue: leader_rx,
            out_queue: out_tx,
            invalid_queue: invalid_tx,
        },
        NetworkHandle {
            in_queue: in_tx,
            leader_in_queue: leader_tx,
            out_queue: out_rx,
            invalid_queue: invalid_rx,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::MissingData;
    use crate::utilities::hash::sha256;

    #[tokio::test]
    async fn test_queues_connect() {
        let (mut engine, network) = channel_pair(QUEUE_CAPACITY);
        let message = Message::MissingData(MissingData::new(1, sha256(b"x")));
        network.in_queue.send(message.clone()).await.unwrap();
        assert_eq!(engine.in_queue.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_outbound_modes() {
        let message = Message::MissingData(MissingData::new(1, sha256(b"x")));
        assert!(!OutboundMessage::broadcast(message.clone()).peer_to_peer);
        assert!(OutboundMessage::direct(message).peer_to_peer);
    }
}
