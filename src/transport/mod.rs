//! QUIC transport
//!
//! - TLS and endpoint configuration shared by servers, clients and peers
//! - Framed reads and writes over the control stream

pub mod stream;
pub mod tls;

pub use stream::{FrameReader, FrameWriter, Inbound, encode_checked};
pub use tls::{ALPN, TransportSettings, client_config, client_endpoint, server_config};
