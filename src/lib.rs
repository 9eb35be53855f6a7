//! A reliable, ordered, message-oriented ARQ engine layered on top of an
//! unreliable datagram transport.
//!
//! The engine is a pure state machine: the host feeds it inbound
//! datagrams, application payloads and clock ticks, and receives outbound
//! datagrams through a sink plus reassembled in-order messages. It never
//! opens a socket and never reads a clock, so it slots under any
//! transport and any runtime.
//!
//! The segment format follows the KCP protocol, byte-for-byte compatible
//! with other KCP implementations on the wire.
//!
//! ```
//! use rkcp::ControlBlockBuilder;
//!
//! let mut kcp = ControlBlockBuilder {
//!     conv: 1,
//!     output: Box::new(|datagram: &[u8]| {
//!         // hand the datagram to the transport, e.g. UdpSocket::send
//!         let _ = datagram;
//!     }),
//! }
//! .build();
//!
//! kcp.send(b"hello").unwrap();
//! kcp.update(0); // drives the flush; datagrams leave through the sink
//! ```

mod engine;
pub mod protocol;
mod utils;

pub use engine::{
    ControlBlock, ControlBlockBuilder, InputError, MtuError, OutputSink, RecvError, SendError,
    Stat,
};
