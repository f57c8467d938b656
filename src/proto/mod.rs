// # Wire Protocol
//
// JSON message types exchanged between coordinator and worker. Every
// state-changing request carries the version/auth envelope; every response
// is a JSON envelope whose embedded `success` field is authoritative.
//
// Integer-valued fields tolerate string-encoded integers on ingress and
// always emit plain integers on egress.

pub mod bundle;
pub mod envelope;
pub mod notify;
pub mod status;

pub use envelope::{AuthContext, Envelope, ResponseMsg, PROTOCOL_VERSION};
