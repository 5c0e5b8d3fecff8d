//! Netfilter / routing-policy driver layer
//!
//! Everything the daemon does to the kernel goes through the
//! [`NetfilterDriver`] trait: a thin, idempotent capability set over
//! iptables chains, IP-sets, policy rules, routes and link state. Kernel
//! tables are externally mutable (flushed by firewalls, rewritten by hooks),
//! so every operation is written to be re-runnable: create-then-create and
//! delete-of-absent both succeed.

pub mod command;
pub mod driver;
pub mod journal;
pub mod memory;
pub mod portremap;

pub use command::CommandDriver;
pub use driver::{LinkChange, LinkEvent, NetfilterDriver, PolicyRule, RouteSpec};
pub use journal::{CachedRule, JournaledDriver};
pub use memory::MemoryDriver;
pub use portremap::PortRemap;
