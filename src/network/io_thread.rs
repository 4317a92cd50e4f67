//! IO thread pool: satu EventLoop per thread, connection di-handoff round-robin
//!
//! Handoff = kirim socket hasil accept ke inbox worker + satu wake.
//! Worker yang membangun `TcpConnection`, jadi semua callback connection
//! itu hanya pernah jalan di thread worker tersebut.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use mio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::config::ServerConfig;
use super::connection::{ConnectionRole, Dispatcher, TcpConnection, TcpState};
use super::net_addr::NetAddress;
use crate::core::{EventLoop, LoopHandle};
use crate::error::{NetError, Result};
use crate::protocol::TinyPbCodec;

/// Pesan ke inbox worker
pub enum WorkerMsg {
    /// Socket baru hasil accept
    Adopt { stream: TcpStream, peer: NetAddress },
    /// Tutup connection yang idle lebih lama dari `idle_timeout`
    Sweep { idle_timeout: Duration },
}

/// State milik thread worker (tidak pernah keluar dari thread itu)
struct Worker {
    index: usize,
    event_loop: EventLoop,
    inbox: Receiver<WorkerMsg>,
    connections: RefCell<Vec<Rc<TcpConnection>>>,
    config: ServerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    adopted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    reap_scheduled: Cell<bool>,
    self_ref: Weak<Worker>,
}

impl Worker {
    fn drain_inbox(&self) {
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                WorkerMsg::Adopt { stream, peer } => self.adopt(stream, peer),
                WorkerMsg::Sweep { idle_timeout } => self.sweep(idle_timeout),
            }
        }
    }

    fn adopt(&self, stream: TcpStream, peer: NetAddress) {
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "set_nodelay failed");
            }
        }

        let connection = match TcpConnection::new(
            &self.event_loop,
            stream,
            peer,
            ConnectionRole::Server,
            self.config.buffer_size,
            TinyPbCodec::new(self.config.max_frame_len),
            Some(self.dispatcher.clone()),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                error!(%peer, error = %e, "failed to set up accepted connection");
                return;
            }
        };

        if let Err(e) = connection.listen_read() {
            error!(%peer, error = %e, "failed to arm read for accepted connection");
            connection.clear();
            return;
        }

        // Connection yang ditutup peer langsung dilepas, tidak menunggu sweep
        let worker = self.self_ref.clone();
        connection.set_close_hook(move || {
            if let Some(worker) = worker.upgrade() {
                worker.schedule_reap();
            }
        });

        self.connections.borrow_mut().push(connection);
        self.live.store(self.connections.borrow().len(), Ordering::Relaxed);
        self.adopted.fetch_add(1, Ordering::Relaxed);
        info!(%peer, worker = self.index, "connection adopted");
    }

    /// Reap lewat timer nol-delay: `Rc` connection tidak di-drop dari
    /// dalam method connection itu sendiri
    fn schedule_reap(&self) {
        if self.reap_scheduled.replace(true) {
            return;
        }
        let worker = self.self_ref.clone();
        self.event_loop.run_after(Duration::ZERO, move || {
            if let Some(worker) = worker.upgrade() {
                worker.reap_closed();
            }
        });
    }

    fn reap_closed(&self) {
        self.reap_scheduled.set(false);
        let closed: Vec<Rc<TcpConnection>> = {
            let mut connections = self.connections.borrow_mut();
            let (closed, live): (Vec<_>, Vec<_>) = connections
                .drain(..)
                .partition(|c| c.state() == TcpState::Closed);
            *connections = live;
            self.live.store(connections.len(), Ordering::Relaxed);
            closed
        };
        debug!(worker = self.index, reaped = closed.len(), "closed connections released");
    }

    fn sweep(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let idle: Vec<Rc<TcpConnection>> = self
            .connections
            .borrow()
            .iter()
            .filter(|c| {
                c.state() != TcpState::Closed
                    && now.saturating_duration_since(c.last_active()) >= idle_timeout
            })
            .cloned()
            .collect();

        for connection in &idle {
            info!(peer = %connection.peer_addr(), worker = self.index, "closing idle connection");
            connection.clear();
        }

        let mut connections = self.connections.borrow_mut();
        let before = connections.len();
        connections.retain(|c| c.state() != TcpState::Closed);
        self.live.store(connections.len(), Ordering::Relaxed);
        debug!(
            worker = self.index,
            closed = before - connections.len(),
            live = connections.len(),
            "sweep done"
        );
    }

    fn close_all(&self) {
        let connections: Vec<Rc<TcpConnection>> = self.connections.borrow_mut().drain(..).collect();
        self.live.store(0, Ordering::Relaxed);
        for connection in connections {
            connection.clear();
        }
    }
}

/// Sisi main thread dari satu IO thread
pub struct IoThread {
    index: usize,
    handle: LoopHandle,
    inbox: Sender<WorkerMsg>,
    adopted: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    join: RefCell<Option<JoinHandle<()>>>,
}

impl IoThread {
    /// Spawn thread + loop-nya, tunggu sampai loop siap menerima handoff
    pub fn spawn(index: usize, config: ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let (inbox_tx, inbox_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let adopted = Arc::new(AtomicUsize::new(0));
        let counter = adopted.clone();
        let live = Arc::new(AtomicUsize::new(0));
        let live_counter = live.clone();

        let join = thread::Builder::new()
            .name(format!("tinyrpc-io-{index}"))
            .spawn(move || {
                let event_loop = match EventLoop::with_capacity(config.events_capacity) {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        error!(worker = index, error = %e, "failed to create event loop");
                        return;
                    }
                };

                let worker = Rc::new_cyclic(|self_ref| Worker {
                    index,
                    event_loop: event_loop.clone(),
                    inbox: inbox_rx,
                    connections: RefCell::new(Vec::new()),
                    config,
                    dispatcher,
                    adopted: counter,
                    live: live_counter,
                    reap_scheduled: Cell::new(false),
                    self_ref: self_ref.clone(),
                });

                let weak = Rc::downgrade(&worker);
                event_loop.add_wakeup_hook(move || {
                    if let Some(worker) = weak.upgrade() {
                        worker.drain_inbox();
                    }
                });

                if ready_tx.send(event_loop.handle()).is_err() {
                    return;
                }
                debug!(worker = index, "io thread running");

                if let Err(e) = event_loop.run() {
                    error!(worker = index, error = %e, "io thread loop failed");
                }
                worker.close_all();
                debug!(worker = index, "io thread exited");
            })?;

        let handle = ready_rx.recv().map_err(|_| NetError::IoThreadStart(index))?;

        Ok(Self {
            index,
            handle,
            inbox: inbox_tx,
            adopted,
            live,
            join: RefCell::new(Some(join)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Jumlah connection yang sudah diterima worker ini
    pub fn adopted(&self) -> usize {
        self.adopted.load(Ordering::Relaxed)
    }

    /// Jumlah connection yang masih dipegang worker ini
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Masukkan pesan ke inbox lalu bangunkan loop worker
    pub fn handoff(&self, msg: WorkerMsg) -> Result<()> {
        self.inbox
            .send(msg)
            .map_err(|_| NetError::IoThreadGone(self.index))?;
        self.handle.wakeup()
    }

    fn join(&self) {
        if let Some(join) = self.join.borrow_mut().take() {
            if join.join().is_err() {
                error!(worker = self.index, "io thread panicked");
            }
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.handle.stop();
        self.join();
    }
}

/// Pool IO thread dengan round-robin selection
pub struct IoThreadGroup {
    threads: Vec<IoThread>,
    next: Cell<usize>,
}

impl IoThreadGroup {
    pub fn new(config: &ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let count = config.io_threads.max(1);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            threads.push(IoThread::spawn(index, config.clone(), dispatcher.clone())?);
        }
        info!(count, "io threads started");
        Ok(Self {
            threads,
            next: Cell::new(0),
        })
    }

    /// IO thread berikutnya (round-robin)
    pub fn next(&self) -> &IoThread {
        let index = self.next.get();
        self.next.set((index + 1) % self.threads.len());
        &self.threads[index]
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn threads(&self) -> &[IoThread] {
        &self.threads
    }

    pub fn handles(&self) -> Vec<LoopHandle> {
        self.threads.iter().map(|t| t.handle.clone()).collect()
    }

    /// Jumlah connection yang diterima tiap worker, urut per index
    pub fn handoff_counts(&self) -> Vec<usize> {
        self.threads.iter().map(IoThread::adopted).collect()
    }

    pub fn live_counts(&self) -> Vec<usize> {
        self.threads.iter().map(IoThread::live).collect()
    }

    /// Minta semua worker menyapu connection idle
    pub fn broadcast_sweep(&self, idle_timeout: Duration) {
        for thread in &self.threads {
            if let Err(e) = thread.handoff(WorkerMsg::Sweep { idle_timeout }) {
                warn!(worker = thread.index, error = %e, "failed to post sweep");
            }
        }
    }

    pub fn stop(&self) {
        for thread in &self.threads {
            thread.handle.stop();
        }
    }

    pub fn join(&self) {
        for thread in &self.threads {
            thread.join();
        }
    }
}

impl Drop for IoThreadGroup {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
