//! The inter-daemon protocol layer.
//!
//! Every connection starts with a greeting: the client sends its node id
//! and a protocol name, the server replies with its node id or closes
//! with a mismatch. Accepted connections are dispatched to the handler
//! registered for the protocol name and run on a bounded worker pool.
//!
//! Bulk diff transfer uses the `wdiff-send` protocol: a metadata request,
//! an accept/reject reply, then a pack-framed stream bracketed by
//! stream-control tags.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod background;
mod frame;
mod server;
mod wdiff_send;

pub use background::{TaskDispatcher, TaskQueue, TaskRunner};
pub use frame::{
    recv_bytes, recv_msg, recv_stream_control, send_bytes, send_msg, send_stream_control,
    Greeting, GreetingReply, Reply, StreamControl,
};
pub use server::{connect, ProtocolHandler, ProtocolServer, ServerControl};
pub use wdiff_send::{
    ack_wdiff_stream, recv_wdiff_stream, send_wdiff_stream, WdiffSendReq, PROTO_WDIFF_SEND,
};
