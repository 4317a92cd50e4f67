//! TinyRPC echo server
//!
//! Server demo di atas transport core:
//! - `Echo.echo`: payload dikembalikan apa adanya
//! - `Echo.ping`: reply `pong`
//! - method lain: error `MethodNotFound`
//!
//! Usage:
//!   cargo run --release --bin tinyrpc_server -- [OPTIONS]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use tinyrpc_net::network::DEFAULT_IO_THREADS;
use tinyrpc_net::{Dispatcher, ErrorCode, NetAddress, ServerConfig, TcpConnection, TcpServer, TinyPbFrame};

#[derive(Parser, Debug)]
#[command(name = "tinyrpc_server")]
#[command(about = "TinyPB echo server over the tinyrpc-net transport core")]
struct Args {
    /// Alamat bind (host:port)
    #[arg(short, long, default_value = "0.0.0.0:9999")]
    bind: NetAddress,

    /// Jumlah IO thread
    #[arg(short = 't', long, default_value_t = DEFAULT_IO_THREADS)]
    io_threads: usize,

    /// Tutup connection yang idle lebih lama dari ini (detik)
    #[arg(long, default_value_t = 75)]
    idle_timeout_secs: u64,

    /// Interval sweep connection idle (detik)
    #[arg(long, default_value_t = 10)]
    sweep_interval_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Dispatcher demo, juga menghitung request yang dilayani
#[derive(Default)]
struct EchoDispatcher {
    served: AtomicU64,
}

impl Dispatcher for EchoDispatcher {
    fn dispatch(&self, request: &TinyPbFrame, response: &mut TinyPbFrame, connection: &TcpConnection) {
        let n = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            peer = %connection.peer_addr(),
            msg_id = %request.msg_id,
            method = %request.method_name,
            served = n,
            "dispatch"
        );

        match request.method_name.as_str() {
            "Echo.echo" => response.pb_data = request.pb_data.clone(),
            "Echo.ping" => response.pb_data = b"pong".to_vec(),
            other => response.set_error(
                ErrorCode::MethodNotFound,
                format!("method `{other}` not found"),
            ),
        }
    }
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("tinyrpc_net=debug,tinyrpc_server=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let args = Args::parse();
    setup_tracing(args.verbose);

    let config = match ServerConfig::builder()
        .bind_addr(args.bind)
        .io_threads(args.io_threads)
        .idle_timeout(Duration::from_secs(args.idle_timeout_secs))
        .sweep_interval(Duration::from_secs(args.sweep_interval_secs.max(1)))
        .build()
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    println!("🚀 TINYRPC ECHO SERVER");
    println!("======================\n");

    let dispatcher = Arc::new(EchoDispatcher::default());
    let server = match TcpServer::new(config, dispatcher.clone()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("❌ Server error: {e}");
            std::process::exit(1);
        }
    };

    println!("🔌 Listening on {}", server.local_addr());
    println!("🧵 IO threads: {}", server.io_threads().len());
    println!(
        "⏱️  Idle timeout: {}s (sweep every {}s)",
        server.config().idle_timeout.as_secs(),
        server.config().sweep_interval.as_secs()
    );
    println!("\n📡 Waiting for connections...\n");

    if let Err(e) = server.start() {
        eprintln!("❌ Server error: {e}");
        std::process::exit(1);
    }

    info!(served = dispatcher.served.load(Ordering::Relaxed), "server exited");
}
