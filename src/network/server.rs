//! TcpServer: main loop (accept only) + IO thread group
//!
//! Main loop:
//! - readable di listening fd -> accept sampai would-block -> handoff round-robin
//! - timer periodik -> minta tiap worker menyapu connection idle
//!
//! `start()` blocking di thread pemanggil sampai `ServerHandle::stop()`.

use std::io;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::acceptor::TcpAcceptor;
use super::config::ServerConfig;
use super::connection::Dispatcher;
use super::io_thread::{IoThreadGroup, WorkerMsg};
use super::net_addr::NetAddress;
use crate::core::{EventLoop, FdEvent, FdInterest, LoopHandle};
use crate::error::Result;

pub struct TcpServer {
    config: ServerConfig,
    main_loop: EventLoop,
    acceptor: Rc<TcpAcceptor>,
    group: Rc<IoThreadGroup>,
}

/// Handle `Send + Clone` untuk menghentikan server dari thread lain
#[derive(Debug, Clone)]
pub struct ServerHandle {
    main: LoopHandle,
    workers: Vec<LoopHandle>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.main.stop();
        for worker in &self.workers {
            worker.stop();
        }
    }
}

impl TcpServer {
    /// Bind listening socket dan spawn IO thread. Main loop = loop thread ini.
    pub fn new(config: ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        config.validate()?;
        let main_loop = EventLoop::current()?;
        let acceptor = TcpAcceptor::bind(&config.bind_addr)?;
        let group = IoThreadGroup::new(&config, dispatcher)?;

        Ok(Self {
            config,
            main_loop,
            acceptor: Rc::new(acceptor),
            group: Rc::new(group),
        })
    }

    pub fn local_addr(&self) -> NetAddress {
        self.acceptor.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn io_threads(&self) -> &IoThreadGroup {
        &self.group
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            main: self.main_loop.handle(),
            workers: self.group.handles(),
        }
    }

    /// Jalankan main loop sampai di-stop, lalu hentikan semua IO thread
    pub fn start(&self) -> Result<()> {
        let mut accept_event = FdEvent::new(self.acceptor.fd())?;
        let acceptor = Rc::downgrade(&self.acceptor);
        let group = Rc::downgrade(&self.group);
        accept_event.listen(FdInterest::Readable, move || {
            if let (Some(acceptor), Some(group)) = (acceptor.upgrade(), group.upgrade()) {
                accept_all(&acceptor, &group);
            }
        });
        self.main_loop.add_event(&accept_event)?;

        let group = Rc::downgrade(&self.group);
        let idle_timeout = self.config.idle_timeout;
        let sweep_timer = self.main_loop.run_every(self.config.sweep_interval, move || {
            if let Some(group) = group.upgrade() {
                group.broadcast_sweep(idle_timeout);
            }
        });

        info!(
            addr = %self.local_addr(),
            io_threads = self.group.len(),
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "tcp server started"
        );

        let result = self.main_loop.run();

        sweep_timer.cancel();
        self.main_loop.delete_event(&accept_event)?;
        self.group.stop();
        self.group.join();
        info!(handoffs = ?self.group.handoff_counts(), "tcp server stopped");
        result
    }
}

/// Accept semua connection yang antri, lalu handoff ke worker berikutnya
fn accept_all(acceptor: &TcpAcceptor, group: &IoThreadGroup) {
    loop {
        match acceptor.accept() {
            Ok((stream, peer)) => {
                let worker = group.next();
                debug!(%peer, worker = worker.index(), "accepted, handing off");
                if let Err(e) = worker.handoff(WorkerMsg::Adopt { stream, peer }) {
                    error!(%peer, worker = worker.index(), error = %e, "handoff failed");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr())
            .field("io_threads", &self.group.len())
            .finish()
    }
}
