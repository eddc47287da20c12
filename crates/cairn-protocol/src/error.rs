/// Errors surfaced by the protocol layer. Cross-node failures travel as
/// data inside acks; these cover only the local machinery.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No ack arrived before the command deadline.
    #[error("command timed out")]
    Timeout,

    /// The peer's reply channel closed before resolving.
    #[error("peer closed before replying")]
    Closed,

    /// An inbound message could not be decoded. The message is dropped;
    /// the node keeps running.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("bus i/o: {0}")]
    Io(#[from] std::io::Error),
}
