//! Next-hop resolution
//!
//! - [`NextHopTable`]: exact and CIDR routes to physical endpoints
//! - [`ClientPool`]: bounded LRU of endpoints learned from inbound traffic

mod pool;
mod table;

pub use pool::{ClientPool, Learned, DEFAULT_CLIENT_POOL_CAPACITY};
pub use table::{NextHopTable, RouteKey};
