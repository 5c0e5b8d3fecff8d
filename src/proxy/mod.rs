//! Transparent DNS proxy
//!
//! The proxy owns the UDP listener that captured port-53 traffic is
//! redirected to. It forwards requests verbatim to the upstream resolver,
//! parses replies for the routing pipeline, and always answers clients with
//! the exact upstream bytes.

pub mod udp;

use async_trait::async_trait;

use crate::codec::DnsMessage;

pub use udp::DnsProxy;

/// Sink for parsed upstream replies
///
/// Invoked before the reply is forwarded to the client, so the routing state
/// is updated before any client retry can race it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, msg: &DnsMessage);
}
