//! Network Layer: connection, client, dan server multi-thread di atas reactor
//!
//! - `TcpConnection`: state machine per socket, in/out buffer + codec
//! - `TcpClient`: connect/write/read async dengan continuation
//! - `TcpServer`: acceptor di main loop, connection di-handoff ke IO thread

mod acceptor;
mod client;
mod config;
mod connection;
mod io_thread;
mod net_addr;
mod server;

pub use acceptor::TcpAcceptor;
pub use client::TcpClient;
pub use config::{
    ClientConfig, ServerConfig, ServerConfigBuilder, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_IO_THREADS, DEFAULT_SWEEP_INTERVAL,
};
pub use connection::{ConnectionRole, Continuation, Dispatcher, TcpConnection, TcpState};
pub use io_thread::{IoThread, IoThreadGroup, WorkerMsg};
pub use net_addr::NetAddress;
pub use server::{ServerHandle, TcpServer};
