use crate::error::{BlockchainError, Result};
use crate::network::message::{read_frame, write_frame, Message};
use crate::utils::sync::lock;
use log::debug;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Socket is up but the peer is not registered under an address yet
    Connecting,
    /// Registered; our SYNC_REQUEST is in flight
    Syncing,
    /// The peer's chain has been received and resolved at least once
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Write half of a connection, shared by every thread that sends to this peer.
///
/// Frames are written under `writer`'s lock so concurrent senders never interleave.
#[derive(Debug)]
pub struct PeerLink {
    id: u64,
    remote: SocketAddr,
    direction: Direction,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    state: Mutex<LinkState>,
    peer_addr: Mutex<Option<SocketAddr>>, // advertised address once registered
}

/// Read half of a connection, owned by the link's handler thread
pub struct LinkReader {
    reader: BufReader<TcpStream>,
    max_frame_bytes: usize,
}

impl PeerLink {
    /// Dial `addr` and split the connection into its two halves
    pub fn connect(
        id: u64,
        addr: SocketAddr,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<(PeerLink, LinkReader)> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| BlockchainError::Transport(format!("Failed to connect to {addr}: {e}")))?;
        Self::from_stream(id, stream, Direction::Outbound, timeout, max_frame_bytes)
    }

    pub fn from_stream(
        id: u64,
        stream: TcpStream,
        direction: Direction,
        write_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<(PeerLink, LinkReader)> {
        let remote = stream
            .peer_addr()
            .map_err(|e| BlockchainError::Transport(format!("Failed to get peer address: {e}")))?;
        stream
            .set_write_timeout(Some(write_timeout))
            .map_err(|e| BlockchainError::Transport(format!("Failed to set write timeout: {e}")))?;
        let _ = stream.set_nodelay(true);
        let clone = || {
            stream
                .try_clone()
                .map_err(|e| BlockchainError::Transport(format!("Failed to clone socket: {e}")))
        };
        let read_half = clone()?;
        let control = clone()?;

        let link = PeerLink {
            id,
            remote,
            direction,
            writer: Mutex::new(stream),
            control,
            state: Mutex::new(LinkState::Connecting),
            peer_addr: Mutex::new(None),
        };
        let reader = LinkReader {
            reader: BufReader::new(read_half),
            max_frame_bytes,
        };
        Ok((link, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Socket address of the remote end as seen by the OS
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.state);
        if *current != LinkState::Closed {
            *current = state;
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.peer_addr)
    }

    pub(crate) fn set_peer_addr(&self, addr: SocketAddr) {
        *lock(&self.peer_addr) = Some(addr);
    }

    /// Registered address if known, otherwise the raw socket address
    pub fn label(&self) -> SocketAddr {
        self.peer_addr().unwrap_or(self.remote)
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        debug!("Sending {} to {}", message.kind(), self.label());
        self.send_encoded(&message.encode()?)
    }

    /// Write an already-encoded message; used by broadcast to encode once.
    pub fn send_encoded(&self, payload: &[u8]) -> Result<()> {
        if self.state() == LinkState::Closed {
            return Err(BlockchainError::Transport(format!(
                "Link to {} is closed",
                self.label()
            )));
        }
        let result = {
            let mut writer = lock(&self.writer);
            write_frame(&mut *writer, payload)
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Shut the socket down both ways; unblocks the handler's pending read.
    pub fn close(&self) {
        *lock(&self.state) = LinkState::Closed;
        // Goes through its own handle so a writer blocked mid-frame cannot delay it
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl LinkReader {
    /// Bound how long `receive` waits for data; `None` waits indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|e| BlockchainError::Transport(format!("Failed to set read timeout: {e}")))
    }

    /// `Ok(None)` on a clean close, `Err(Protocol)` for an undecodable frame that has
    /// been skipped, `Err(Transport)` when the stream is unusable.
    pub fn receive(&mut self) -> Result<Option<Message>> {
        match read_frame(&mut self.reader, self.max_frame_bytes)? {
            Some(payload) => Message::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}
