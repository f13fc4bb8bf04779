//! Backend transport: bodies and connections.

pub mod body;
pub mod connection;
pub mod http;

pub use body::{BodyMode, BufferFlow, ChunkStream};
pub use connection::{ProxyConnection, ProxyResponse, SyntheticConnection, SyntheticResponse};
pub use http::HttpProxyConnection;
