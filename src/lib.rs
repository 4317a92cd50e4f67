//! tinyrpc-net - Transport core untuk RPC TinyPB
//!
//! Arsitektur:
//! - Reactor: satu `EventLoop` per thread di atas mio (epoll/kqueue)
//! - Framing: record TinyPB length-prefixed dengan checksum, resync otomatis
//! - Connection: state machine per socket, continuation untuk read/write
//! - Server: main loop accept-only + pool IO thread, handoff round-robin
//!
//! Contoh client (di thread yang sama dengan loop-nya):
//!
//! ```no_run
//! use tinyrpc_net::{EventLoop, TcpClient, TinyPbFrame};
//!
//! # fn main() -> tinyrpc_net::Result<()> {
//! let client = TcpClient::new("127.0.0.1:9999".parse()?)?;
//! let c = client.clone();
//! client.connect(move || {
//!     let stopper = c.clone();
//!     c.write_message(TinyPbFrame::new("1", "Echo.echo", b"ping".to_vec()), |_| {});
//!     c.read_message("1", move |reply| {
//!         println!("reply: {:?}", reply.pb_data);
//!         stopper.stop();
//!     });
//! });
//! EventLoop::current()?.run()?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("tinyrpc-net only supports unix targets");

pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use crate::core::{EventLoop, LoopHandle, TcpBuffer, TimerEvent, TimerHandle};
pub use crate::error::{NetError, Result};
pub use crate::network::{
    ClientConfig, Dispatcher, NetAddress, ServerConfig, ServerHandle, TcpClient, TcpConnection,
    TcpServer, TcpState,
};
pub use crate::protocol::{Codec, ErrorCode, TinyPbCodec, TinyPbFrame};
