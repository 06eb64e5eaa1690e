//! TCP stream relaying for balanced sessions.

mod handler;
mod tcp_proxy;

pub use handler::{StreamPluginHandler, StreamSessionHandler};
pub use tcp_proxy::{
    Redirect, RelayEnd, RelayStats, TcpProxyError, connect_to_backend, relay,
};
