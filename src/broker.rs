//! TCP Messaging Broker Engine — a length-framed TCP server and matching
//! client, ported from `tcp_server.py` / `tcp_client.py`.

pub mod client;
pub mod frame;
pub mod server;

pub use client::{BrokerClient, BrokerClientStats, ConnectionConfig};
pub use server::{BrokerServer, BrokerServerConfig, BrokerServerStats};
