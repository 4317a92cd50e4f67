//! TinyRPC client: satu request, satu reply
//!
//! Connect, kirim satu request, tunggu reply (dengan timeout), lalu keluar.
//! Exit code 0 kalau reply sukses, 1 kalau error.
//!
//! Usage:
//!   cargo run --release --bin tinyrpc_client -- --addr 127.0.0.1:9999 --payload hello

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::debug;

use tinyrpc_net::{EventLoop, NetAddress, TcpClient, TinyPbFrame};

#[derive(Parser, Debug)]
#[command(name = "tinyrpc_client")]
#[command(about = "Send one TinyPB request and print the reply")]
struct Args {
    /// Alamat server (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: NetAddress,

    /// Nama method
    #[arg(short, long, default_value = "Echo.echo")]
    method: String,

    /// Payload (UTF-8)
    #[arg(short, long, default_value = "ping")]
    payload: String,

    /// Message id untuk korelasi
    #[arg(long, default_value = "1")]
    msg_id: String,

    /// Batas waktu tunggu reply (ms)
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

enum Outcome {
    ConnectFailed(i32, String),
    Reply(TinyPbFrame),
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("tinyrpc_net=debug,tinyrpc_client=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: Args) -> tinyrpc_net::Result<Option<Outcome>> {
    let event_loop = EventLoop::current()?;
    let client = TcpClient::new(args.addr)?;
    let outcome: Rc<RefCell<Option<Outcome>>> = Rc::new(RefCell::new(None));
    let start = Instant::now();

    let c = client.clone();
    let out = outcome.clone();
    client.connect(move || {
        if c.connect_error_code() != 0 {
            *out.borrow_mut() = Some(Outcome::ConnectFailed(
                c.connect_error_code(),
                c.connect_error_info(),
            ));
            c.stop();
            return;
        }
        debug!(local = ?c.local_addr(), "connected");

        let request = TinyPbFrame::new(args.msg_id.clone(), args.method, args.payload.into_bytes());
        c.write_message(request, |sent| debug!(msg_id = %sent.msg_id, "request flushed"));

        let stopper = c.clone();
        let out = out.clone();
        c.read_message_with_timeout(
            args.msg_id,
            Duration::from_millis(args.timeout_ms),
            move |reply| {
                *out.borrow_mut() = Some(Outcome::Reply(reply));
                stopper.stop();
            },
        );
    });

    if outcome.borrow().is_none() {
        event_loop.run()?;
    }
    debug!(elapsed_us = start.elapsed().as_micros() as u64, "round trip done");

    let result = outcome.borrow_mut().take();
    Ok(result)
}

fn main() {
    let args = Args::parse();
    setup_tracing(args.verbose);
    let addr = args.addr;

    let code = match run(args) {
        Ok(Some(Outcome::Reply(reply))) if reply.is_ok() => {
            println!("✅ [{}] {}", reply.msg_id, String::from_utf8_lossy(&reply.pb_data));
            0
        }
        Ok(Some(Outcome::Reply(reply))) => {
            let code = reply
                .error_code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| reply.err_code.to_string());
            eprintln!("❌ [{}] error {}: {}", reply.msg_id, code, reply.err_info);
            1
        }
        Ok(Some(Outcome::ConnectFailed(code, info))) => {
            eprintln!("❌ Connect to {addr} failed ({code}): {info}");
            1
        }
        Ok(None) => {
            eprintln!("❌ Event loop exited without a reply");
            1
        }
        Err(e) => {
            eprintln!("❌ Client error: {e}");
            1
        }
    };

    std::process::exit(code);
}
