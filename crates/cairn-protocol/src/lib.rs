//! The cairn command/notify protocol: message shapes, the pub/sub bus
//! seam, and the request/reply peer with correlation-id bookkeeping.

pub mod bus;
pub mod error;
pub mod message;
pub mod net;
pub mod peer;

pub use bus::{Bus, LocalBus, KEY_ALL};
pub use error::ProtocolError;
pub use message::{
    Ack, Command, DataMessage, EnableInstrumentation, EnableStatus, Envelope, Notify, Payload,
    StatusReport,
};
pub use peer::Peer;
