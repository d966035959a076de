use crate::core::{Block, Blockchain};
use crate::error::BlockchainError;
use crate::network::message::Message;
use crate::network::node::{Node, Severity};
use crate::network::peer::{Direction, LinkReader, LinkState, PeerLink};
use crate::utils::sync::lock;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

impl Node {
    /// Body of a link's handler thread. Returns once the link is closed, the peer hangs up,
    /// too many undecodable frames arrive in a row, or an inbound peer never sends CONNECT.
    pub(crate) fn handle_link(&self, link: Arc<PeerLink>, mut reader: LinkReader) {
        let max_errors = self.inner.config.max_protocol_errors;
        let mut protocol_errors = 0u32;
        let mut handshake_deadline = match link.direction() {
            Direction::Inbound => Some(Instant::now() + self.inner.config.handshake_timeout()),
            Direction::Outbound => None,
        };

        while self.is_running() {
            if let Some(deadline) = handshake_deadline {
                if !self.await_handshake(&link, &mut reader, deadline) {
                    break;
                }
                if link.peer_addr().is_some() {
                    handshake_deadline = None;
                }
            }

            match reader.receive() {
                Ok(Some(message)) => {
                    protocol_errors = 0;
                    debug!("Received {} from {}", message.kind(), link.label());
                    self.process_message(&link, message);
                }
                Ok(None) => {
                    debug!("Peer {} closed the connection", link.label());
                    break;
                }
                Err(BlockchainError::Protocol(e)) => {
                    protocol_errors += 1;
                    self.emit(
                        format!("Discarded malformed message from {}: {e}", link.label()),
                        Severity::Error,
                    );
                    if protocol_errors >= max_errors {
                        self.emit(
                            format!(
                                "Dropping {} after {protocol_errors} malformed messages",
                                link.label()
                            ),
                            Severity::Error,
                        );
                        break;
                    }
                }
                Err(e) => {
                    if handshake_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        self.emit(
                            format!("No CONNECT from {} in time; closing", link.label()),
                            Severity::Info,
                        );
                    } else if link.state() != LinkState::Closed {
                        self.emit(
                            format!("Link to {} failed: {e}", link.label()),
                            Severity::Error,
                        );
                    }
                    break;
                }
            }
        }

        self.drop_link(&link);
    }

    /// Bound the next read by what is left of the handshake window, or lift the bound once
    /// the peer has registered. False when the window has already closed.
    fn await_handshake(
        &self,
        link: &PeerLink,
        reader: &mut LinkReader,
        deadline: Instant,
    ) -> bool {
        let timeout = if link.peer_addr().is_some() {
            None
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.emit(
                    format!("No CONNECT from {} in time; closing", link.label()),
                    Severity::Info,
                );
                return false;
            }
            Some(remaining)
        };
        match reader.set_read_timeout(timeout) {
            Ok(()) => true,
            Err(e) => {
                self.emit(
                    format!("Link to {} failed: {e}", link.label()),
                    Severity::Error,
                );
                false
            }
        }
    }

    fn process_message(&self, link: &Arc<PeerLink>, message: Message) {
        match message {
            Message::Connect { port } => self.handle_connect(link, port),
            Message::SyncRequest => self.handle_sync_request(link),
            Message::ChainResponse { blocks } => self.handle_chain_response(link, blocks),
            Message::Block { block } => self.handle_block(link, block),
        }
    }

    /// Register an inbound link under the peer's ip and advertised port, then pull its chain.
    fn handle_connect(&self, link: &Arc<PeerLink>, port: u16) {
        if link.peer_addr().is_some() {
            debug!("Ignoring repeated CONNECT from {}", link.label());
            return;
        }

        let addr = SocketAddr::new(link.remote().ip(), port);
        if let Err(e) = self.inner.peers.register(addr, link) {
            if !self.resolve_crossed_dial(addr, link) {
                self.emit(format!("Closing connection from {addr}: {e}"), Severity::Info);
                self.drop_link(link);
                return;
            }
        }

        link.set_state(LinkState::Syncing);
        self.emit(format!("Peer {addr} connected"), Severity::Success);
        if let Err(e) = link.send(&Message::SyncRequest) {
            self.emit(
                format!("Failed to request chain from {addr}: {e}"),
                Severity::Error,
            );
            self.drop_link(link);
        }
    }

    /// Both sides dialed each other at once. Each node keeps the link dialed by the lower
    /// listening port, so both ends close the same one.
    fn resolve_crossed_dial(&self, addr: SocketAddr, link: &Arc<PeerLink>) -> bool {
        let peer_dials_lower = self.local_port().is_some_and(|ours| addr.port() < ours);
        if !peer_dials_lower {
            return false;
        }
        let displaced = self.inner.peers.replace_if(addr, link, |current| {
            current.direction() == Direction::Outbound
        });
        match displaced {
            Some(old) => {
                old.close();
                info!("Kept {addr}'s connection over our own dial");
                true
            }
            None => false,
        }
    }

    /// The snapshot is taken under the chain lock; the send happens after it is released.
    fn handle_sync_request(&self, link: &Arc<PeerLink>) {
        let blocks = lock(&self.inner.chain).blocks().to_vec();
        let len = blocks.len();
        if let Err(e) = link.send(&Message::ChainResponse { blocks }) {
            self.emit(
                format!("Failed to send chain to {}: {e}", link.label()),
                Severity::Error,
            );
            self.drop_link(link);
            return;
        }
        debug!("Sent {len} blocks to {}", link.label());
    }

    /// Replay the received chain without the lock, then swap it in only if it is strictly
    /// better than ours at the moment of the swap.
    fn handle_chain_response(&self, link: &Arc<PeerLink>, blocks: Vec<Block>) {
        let (adjustment, skew) = {
            let chain = lock(&self.inner.chain);
            (chain.adjustment(), chain.timestamp_skew())
        };
        if let Err(e) = Blockchain::check_chain_with(&blocks, adjustment, skew) {
            self.emit(
                format!("Rejected chain from {}: {e}", link.label()),
                Severity::Error,
            );
            return;
        }

        let selection = self.inner.config.chain_selection;
        let adopted = {
            let mut chain = lock(&self.inner.chain);
            if chain.is_better_chain(&blocks, selection) {
                chain.install(blocks);
                self.bump_epoch();
                chain.latest().cloned()
            } else {
                None
            }
        };
        link.set_state(LinkState::Established);

        match adopted {
            Some(tail) => {
                self.emit(
                    format!(
                        "Adopted chain of length {} from {}",
                        tail.get_index() + 1,
                        link.label()
                    ),
                    Severity::Success,
                );
                // Peers that cannot append the new tail will ask for the full chain
                self.broadcast(&Message::Block { block: tail }, Some(link.id()));
            }
            None => debug!("Kept local chain over the one from {}", link.label()),
        }
    }

    fn handle_block(&self, link: &Arc<PeerLink>, block: Block) {
        let outcome = {
            let mut chain = lock(&self.inner.chain);
            if chain.contains_block(block.get_index(), block.get_hash()) {
                None
            } else {
                let result = chain.try_append(&block);
                if result.is_ok() {
                    self.bump_epoch();
                }
                Some(result)
            }
        };

        match outcome {
            None => debug!(
                "Already have block {} from {}",
                block.get_index(),
                link.label()
            ),
            Some(Ok(())) => {
                self.emit(
                    format!("Received block {} from {}", block.get_index(), link.label()),
                    Severity::Success,
                );
                self.broadcast(&Message::Block { block }, Some(link.id()));
            }
            Some(Err(e)) => {
                self.emit(
                    format!(
                        "Rejected block {} from {}: {e}",
                        block.get_index(),
                        link.label()
                    ),
                    Severity::Error,
                );
                if let Err(e) = link.send(&Message::SyncRequest) {
                    self.emit(
                        format!("Failed to request chain from {}: {e}", link.label()),
                        Severity::Error,
                    );
                    self.drop_link(link);
                }
            }
        }
    }

    /// Append a locally produced block and gossip it. False (and no change) if it does not
    /// extend the current tail.
    pub fn submit_block(&self, block: Block) -> bool {
        let result = {
            let mut chain = lock(&self.inner.chain);
            let result = chain.try_append(&block);
            if result.is_ok() {
                self.bump_epoch();
            }
            result
        };

        match result {
            Ok(()) => {
                self.emit(
                    format!("Added block {} ({})", block.get_index(), block.get_hash()),
                    Severity::Success,
                );
                self.broadcast(&Message::Block { block }, None);
                true
            }
            Err(e) => {
                self.emit(
                    format!("Rejected block {}: {e}", block.get_index()),
                    Severity::Error,
                );
                false
            }
        }
    }

    /// Send `message` to every registered peer except `except`. Encoded once; links that
    /// fail are dropped. Returns how many peers it reached.
    pub(crate) fn broadcast(&self, message: &Message, except: Option<u64>) -> usize {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.emit(
                    format!("Failed to encode {}: {e}", message.kind()),
                    Severity::Error,
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for link in self.inner.peers.registered_links() {
            if Some(link.id()) == except {
                continue;
            }
            match link.send_encoded(&payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.emit(
                        format!("Failed to send {} to {}: {e}", message.kind(), link.label()),
                        Severity::Error,
                    );
                    self.drop_link(&link);
                }
            }
        }
        delivered
    }

    /// Ask every registered peer for its chain
    pub fn request_sync_from_all(&self) -> usize {
        self.broadcast(&Message::SyncRequest, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{encode_frame, read_frame};
    use crate::testnet::{mine_child, test_config, wait_until};
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn started_node() -> (Node, u16) {
        let node = Node::new(test_config()).unwrap();
        let port = node.start_node(0).unwrap();
        (node, port)
    }

    /// Raw client that speaks the wire protocol by hand
    fn raw_client(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, message: &Message) {
        let frame = encode_frame(&message.encode().unwrap()).unwrap();
        stream.write_all(&frame).unwrap();
    }

    fn receive(stream: &mut TcpStream) -> Message {
        let payload = read_frame(stream, 1 << 20).unwrap().unwrap();
        Message::decode(&payload).unwrap()
    }

    #[test]
    fn test_sync_request_is_answered_with_chain() {
        let (node, port) = started_node();
        node.mine_block("one").unwrap();
        let mut client = raw_client(port);

        send(&mut client, &Message::SyncRequest);
        match receive(&mut client) {
            Message::ChainResponse { blocks } => assert_eq!(blocks, node.chain_snapshot()),
            other => panic!("unexpected {other:?}"),
        }
        node.stop();
    }

    #[test]
    fn test_connect_registers_and_requests_chain() {
        let (node, port) = started_node();
        let mut client = raw_client(port);

        send(&mut client, &Message::Connect { port: 45001 });
        assert_eq!(receive(&mut client), Message::SyncRequest);
        let addr: SocketAddr = "127.0.0.1:45001".parse().unwrap();
        assert!(wait_until(WAIT, || node.peers() == vec![addr]));
        assert_eq!(node.peer_state(&addr), Some(LinkState::Syncing));
        node.stop();
    }

    #[test]
    fn test_duplicate_connect_is_closed() {
        let (node, port) = started_node();
        let mut first = raw_client(port);
        send(&mut first, &Message::Connect { port: 45002 });
        assert_eq!(receive(&mut first), Message::SyncRequest);

        let mut second = raw_client(port);
        send(&mut second, &Message::Connect { port: 45002 });
        // The node hangs up on the duplicate without a reply
        assert!(matches!(read_frame(&mut second, 1 << 20), Ok(None) | Err(_)));
        assert_eq!(node.peer_count(), 1);
        node.stop();
    }

    #[test]
    fn test_valid_block_is_appended() {
        let (node, port) = started_node();
        let block = mine_child(&node.latest_block().unwrap(), 1, b"from peer");
        let mut client = raw_client(port);

        send(&mut client, &Message::Block { block: block.clone() });
        assert!(wait_until(WAIT, || node.height() == 2));
        assert_eq!(node.latest_block(), Some(block));
        node.stop();
    }

    #[test]
    fn test_invalid_block_triggers_sync_request() {
        let (node, port) = started_node();
        let mut orphan = Block::new(5, 1, "unknown parent", b"x".to_vec());
        orphan.mine_until_valid(1, || false).unwrap();
        let mut client = raw_client(port);

        send(&mut client, &Message::Block { block: orphan });
        assert_eq!(receive(&mut client), Message::SyncRequest);
        assert_eq!(node.height(), 1);
        node.stop();
    }

    #[test]
    fn test_duplicate_block_is_ignored_silently() {
        let (node, port) = started_node();
        let tail = node.latest_block().unwrap();
        let mut client = raw_client(port);

        send(&mut client, &Message::Block { block: tail });
        // Nothing comes back for a duplicate, so the next reply is to the sync request
        send(&mut client, &Message::SyncRequest);
        assert!(matches!(
            receive(&mut client),
            Message::ChainResponse { .. }
        ));
        assert_eq!(node.height(), 1);
        node.stop();
    }

    #[test]
    fn test_malformed_frames_are_survived_then_limited() {
        let config = crate::config::NodeConfig {
            max_protocol_errors: 3,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let port = node.start_node(0).unwrap();
        let mut client = raw_client(port);

        client.write_all(&encode_frame(&[0xFF; 8]).unwrap()).unwrap();
        send(&mut client, &Message::SyncRequest);
        assert!(matches!(
            receive(&mut client),
            Message::ChainResponse { .. }
        ));

        for _ in 0..3 {
            client.write_all(&encode_frame(&[0xFF; 8]).unwrap()).unwrap();
        }
        assert!(matches!(read_frame(&mut client, 1 << 20), Ok(None) | Err(_)));
        node.stop();
    }

    #[test]
    fn test_weaker_chain_is_ignored() {
        let (node, port) = started_node();
        node.mine_block("one").unwrap();
        node.mine_block("two").unwrap();
        let before = node.chain_snapshot();

        let mut client = raw_client(port);
        let shorter = before[..2].to_vec();
        send(&mut client, &Message::ChainResponse { blocks: shorter });
        send(&mut client, &Message::SyncRequest);
        receive(&mut client);

        assert_eq!(node.chain_snapshot(), before);
        node.stop();
    }

    /// Heavier than a fresh node's chain, with every block after genesis stamped an hour ahead
    fn future_dated_chain(len: usize) -> Vec<Block> {
        let mut blocks = vec![Node::new(test_config()).unwrap().latest_block().unwrap()];
        let ahead = crate::utils::current_timestamp() + 60 * 60 * 1000;
        while blocks.len() < len {
            let tail = blocks.last().unwrap().clone();
            let mut block =
                Block::with_timestamp(tail.get_index() + 1, ahead, 1, tail.get_hash(), Vec::new());
            block.mine_until_valid(1, || false).unwrap();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_future_dated_chain_is_not_adopted() {
        let (node, port) = started_node();
        let before = node.chain_snapshot();
        let mut client = raw_client(port);

        send(&mut client, &Message::ChainResponse { blocks: future_dated_chain(4) });
        send(&mut client, &Message::SyncRequest);
        receive(&mut client);

        assert_eq!(node.chain_snapshot(), before);
        assert!(node.mine_block("honest").unwrap().is_some());
        node.stop();
    }

    #[test]
    fn test_zero_work_chain_is_not_adopted() {
        let (node, port) = started_node();
        for i in 0..3 {
            node.mine_block(format!("honest {i}")).unwrap();
        }
        let before = node.chain_snapshot(); // work 8

        let mut forged = vec![before[0].clone()];
        while forged.len() < 9 {
            let tail = forged.last().unwrap().clone();
            forged.push(Block::new(tail.get_index() + 1, 0, tail.get_hash(), Vec::new()));
        }
        let mut client = raw_client(port);
        send(&mut client, &Message::ChainResponse { blocks: forged });
        send(&mut client, &Message::SyncRequest);
        receive(&mut client);

        assert_eq!(node.chain_snapshot(), before);
        node.stop();
    }

    #[test]
    fn test_silent_inbound_link_is_closed_after_handshake_timeout() {
        let config = crate::config::NodeConfig {
            handshake_timeout_ms: 200,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let port = node.start_node(0).unwrap();

        let mut silent = raw_client(port);
        // Talking without CONNECT does not extend the window
        send(&mut silent, &Message::SyncRequest);
        assert!(matches!(receive(&mut silent), Message::ChainResponse { .. }));
        assert!(matches!(read_frame(&mut silent, 1 << 20), Ok(None) | Err(_)));
        assert!(wait_until(WAIT, || node.inner.peers.link_count() == 0));
        node.stop();
    }

    #[test]
    fn test_registered_link_outlives_handshake_timeout() {
        let config = crate::config::NodeConfig {
            handshake_timeout_ms: 200,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let port = node.start_node(0).unwrap();
        let mut client = raw_client(port);

        send(&mut client, &Message::Connect { port: 45003 });
        assert_eq!(receive(&mut client), Message::SyncRequest);
        std::thread::sleep(Duration::from_millis(500));

        send(&mut client, &Message::SyncRequest);
        assert!(matches!(receive(&mut client), Message::ChainResponse { .. }));
        assert_eq!(node.peer_count(), 1);
        node.stop();
    }

    #[test]
    fn test_submit_block_rejects_stale_parent() {
        let node = Node::new(test_config()).unwrap();
        let genesis = node.latest_block().unwrap();
        let first = mine_child(&genesis, 1, b"first");
        let rival = mine_child(&genesis, 1, b"rival");

        assert!(node.submit_block(first.clone()));
        assert!(!node.submit_block(rival));
        assert_eq!(node.height(), 2);
        assert_eq!(node.latest_block(), Some(first));
    }
}
