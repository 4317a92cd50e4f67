//! TcpClient: satu outbound connection + exchange request/response async
//!
//! Client tidak pernah menjalankan loop sendiri. Caller menjalankan
//! `EventLoop::run()` di thread client dan menghentikannya dari continuation.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::FromRawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::config::ClientConfig;
use super::connection::{ConnectionRole, TcpConnection, TcpState};
use super::net_addr::NetAddress;
use crate::core::{EventLoop, TimerEvent, TimerHandle};
use crate::error::{NetError, Result};
use crate::protocol::{ErrorCode, TinyPbCodec, TinyPbFrame};

struct ClientInner {
    event_loop: EventLoop,
    peer_addr: NetAddress,
    config: ClientConfig,
    connection: RefCell<Rc<TcpConnection>>,
    connect_error_code: Cell<i32>,
    connect_error_info: RefCell<String>,
}

/// Clone murah; semua clone berbagi connection yang sama
#[derive(Clone)]
pub struct TcpClient {
    inner: Rc<ClientInner>,
}

impl TcpClient {
    pub fn new(peer_addr: NetAddress) -> Result<Self> {
        Self::with_config(peer_addr, ClientConfig::default())
    }

    /// Client di loop thread ini, dengan socket baru yang belum connect
    pub fn with_config(peer_addr: NetAddress, config: ClientConfig) -> Result<Self> {
        if !peer_addr.is_valid() {
            return Err(NetError::InvalidAddress(peer_addr.to_string()));
        }
        let event_loop = EventLoop::current()?;
        let connection = open_connection(&event_loop, &peer_addr, &config)?;

        Ok(Self {
            inner: Rc::new(ClientInner {
                event_loop,
                peer_addr,
                config,
                connection: RefCell::new(connection),
                connect_error_code: Cell::new(0),
                connect_error_info: RefCell::new(String::new()),
            }),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn connection(&self) -> Rc<TcpConnection> {
        self.inner.connection.borrow().clone()
    }

    pub fn peer_addr(&self) -> NetAddress {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> Option<NetAddress> {
        self.connection().local_addr()
    }

    /// 0 kalau connect terakhir sukses (atau belum pernah gagal)
    pub fn connect_error_code(&self) -> i32 {
        self.inner.connect_error_code.get()
    }

    pub fn connect_error_info(&self) -> String {
        self.inner.connect_error_info.borrow().clone()
    }

    /// Error connect terakhir sebagai `NetError::Connect`
    pub fn connect_error(&self) -> Option<NetError> {
        let code = ErrorCode::from_i32(self.inner.connect_error_code.get())?;
        Some(NetError::Connect {
            code,
            info: self.connect_error_info(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection().state() == TcpState::Connected
    }

    /// Connect non-blocking. `on_done` selalu dipanggil tepat sekali;
    /// cek `connect_error_code()` untuk tahu hasilnya.
    pub fn connect<F>(&self, on_done: F)
    where
        F: FnOnce() + 'static,
    {
        let connection = self.connection();
        if connection.state() == TcpState::Connected {
            on_done();
            return;
        }

        let (raw, len) = self.inner.peer_addr.to_raw();
        // SAFETY: raw berisi sockaddr valid sepanjang `len`, fd milik connection
        let rt = unsafe {
            libc::connect(
                connection.fd(),
                &raw as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };

        if rt == 0 {
            self.finish_connect(&connection);
            on_done();
            return;
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            self.fail_connect(err);
            on_done();
            return;
        }

        debug!(peer = %self.inner.peer_addr, "connect in progress");
        let weak: Weak<ClientInner> = Rc::downgrade(&self.inner);
        let pending: Rc<Cell<Option<Box<dyn FnOnce()>>>> = Rc::new(Cell::new(Some(Box::new(on_done))));
        let slot = pending.clone();

        let armed = connection.listen_write_with(move || {
            let Some(done) = slot.take() else {
                return;
            };
            if let Some(inner) = weak.upgrade() {
                let client = TcpClient { inner };
                let connection = client.connection();
                // One-shot: lepas dari multiplexer sebelum cek hasil connect
                if let Err(e) = connection.cancel_write() {
                    warn!(error = %e, "failed to disarm connect watcher");
                }
                client.finish_connect_check(&connection);
            }
            done();
        });

        if let Err(e) = armed {
            self.fail_connect(e);
            if let Some(done) = pending.take() {
                done();
            }
        }
    }

    /// Cek hasil connect setelah socket writable: SO_ERROR lalu getpeername
    fn finish_connect_check(&self, connection: &TcpConnection) {
        let outcome = match connection.stream().take_error() {
            Ok(None) => connection.stream().peer_addr().map(|_| ()),
            Ok(Some(e)) | Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => self.finish_connect(connection),
            Err(e) => self.fail_connect(e),
        }
    }

    fn finish_connect(&self, connection: &TcpConnection) {
        connection.mark_connected();
        self.inner.connect_error_code.set(0);
        self.inner.connect_error_info.borrow_mut().clear();

        info!(
            peer = %self.inner.peer_addr,
            local = ?connection.local_addr(),
            "connected"
        );

        // Request yang diantrikan sebelum connect selesai
        if let Err(e) = connection.listen_read() {
            error!(error = %e, "failed to arm read after connect");
        }
        if connection.pending_writes() > 0 {
            if let Err(e) = connection.listen_write() {
                error!(error = %e, "failed to arm write after connect");
            }
        }
    }

    /// Simpan error, tutup fd, lalu buka socket baru untuk retry
    fn fail_connect(&self, err: io::Error) {
        let (code, info) = if err.kind() == io::ErrorKind::ConnectionRefused {
            (
                ErrorCode::PeerClosed,
                format!("connection refused, sys error = {err}"),
            )
        } else {
            (
                ErrorCode::FailedConnect,
                format!("connect error, sys error = {err}"),
            )
        };
        error!(peer = %self.inner.peer_addr, %code, %info, "connect failed");
        self.inner.connect_error_code.set(code.as_i32());
        *self.inner.connect_error_info.borrow_mut() = info;

        self.connection().clear();
        match open_connection(&self.inner.event_loop, &self.inner.peer_addr, &self.inner.config) {
            Ok(fresh) => {
                *self.inner.connection.borrow_mut() = fresh;
            }
            Err(e) => error!(error = %e, "failed to reopen socket after connect failure"),
        }
    }

    /// Antrikan frame lalu arm write. `on_sent` dipanggil setelah flush.
    pub fn write_message<F>(&self, frame: TinyPbFrame, on_sent: F)
    where
        F: FnOnce(TinyPbFrame) + 'static,
    {
        let connection = self.connection();
        connection.push_send_message(frame, on_sent);
        if connection.state() == TcpState::Connected {
            if let Err(e) = connection.listen_write() {
                error!(error = %e, "failed to arm write");
                connection.clear();
            }
        }
    }

    /// Daftarkan continuation untuk reply `msg_id` lalu arm read
    pub fn read_message<F>(&self, msg_id: impl Into<String>, on_received: F)
    where
        F: FnOnce(TinyPbFrame) + 'static,
    {
        let connection = self.connection();
        connection.push_read_message(msg_id, on_received);
        if connection.state() == TcpState::Connected {
            if let Err(e) = connection.listen_read() {
                error!(error = %e, "failed to arm read");
                connection.clear();
            }
        }
    }

    /// `read_message` dengan deadline. Kalau reply tidak datang dalam
    /// `timeout`, continuation dipanggil dengan `RpcCallTimeout`.
    pub fn read_message_with_timeout<F>(
        &self,
        msg_id: impl Into<String>,
        timeout: Duration,
        on_received: F,
    ) where
        F: FnOnce(TinyPbFrame) + 'static,
    {
        let msg_id = msg_id.into();
        let connection = Rc::downgrade(&self.connection());
        let id = msg_id.clone();

        let timer = self.inner.event_loop.run_after(timeout, move || {
            let Some(connection) = connection.upgrade() else {
                return;
            };
            let info = format!("rpc call timeout after {} ms", timeout.as_millis());
            if connection.fail_pending_read(&id, ErrorCode::RpcCallTimeout, info) {
                warn!(msg_id = %id, "rpc call timed out");
            }
        });

        self.read_message(msg_id, move |frame| {
            timer.cancel();
            on_received(frame);
        });
    }

    /// Jadwalkan timer di loop client
    pub fn add_timer_event(&self, event: TimerEvent) -> TimerHandle {
        self.inner.event_loop.add_timer_event(event)
    }

    /// Half-close connection ke server
    pub fn close(&self) {
        self.connection().shutdown();
    }

    /// Hentikan loop client
    pub fn stop(&self) {
        self.inner.event_loop.stop();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("peer", &self.inner.peer_addr)
            .field("connection", &*self.inner.connection.borrow())
            .field("connect_error_code", &self.inner.connect_error_code.get())
            .finish()
    }
}

fn open_connection(
    event_loop: &EventLoop,
    peer_addr: &NetAddress,
    config: &ClientConfig,
) -> Result<Rc<TcpConnection>> {
    // SAFETY: socket(2) tanpa pointer argument
    let fd = unsafe { libc::socket(peer_addr.family(), libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: fd baru saja dibuat dan belum dimiliki siapa pun
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;
    if config.nodelay {
        std_stream.set_nodelay(true)?;
    }

    TcpConnection::new(
        event_loop,
        TcpStream::from_std(std_stream),
        *peer_addr,
        ConnectionRole::Client,
        config.buffer_size,
        TinyPbCodec::new(config.max_frame_len),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rejects_zero_port() {
        thread::spawn(|| {
            let addr = NetAddress::new("127.0.0.1", 0).unwrap();
            assert!(matches!(
                TcpClient::new(addr),
                Err(NetError::InvalidAddress(_))
            ));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_connect_refused_sets_error_and_reopens() {
        thread::spawn(|| {
            // Port yang barusan dilepas: tidak ada listener
            let port = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().port()
            };
            let addr = NetAddress::new("127.0.0.1", port).unwrap();
            let client = TcpClient::new(addr).unwrap();

            let done = Rc::new(Cell::new(false));
            let d = done.clone();
            let c = client.clone();
            client.connect(move || {
                d.set(true);
                c.stop();
            });
            if !done.get() {
                client.event_loop().run().unwrap();
            }

            assert!(done.get());
            assert_eq!(client.connect_error_code(), ErrorCode::PeerClosed.as_i32());
            assert!(client.connect_error_info().contains("connection refused"));
            assert!(matches!(
                client.connect_error(),
                Some(NetError::Connect { code: ErrorCode::PeerClosed, .. })
            ));
            assert_eq!(client.connection().state(), TcpState::NotConnected);
            assert!(!client.is_connected());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_connect_to_listener_succeeds() {
        thread::spawn(|| {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = NetAddress::from(listener.local_addr().unwrap());
            let client = TcpClient::new(addr).unwrap();

            let done = Rc::new(Cell::new(false));
            let d = done.clone();
            let c = client.clone();
            client.connect(move || {
                d.set(true);
                c.stop();
            });
            if !done.get() {
                client.event_loop().run().unwrap();
            }

            assert!(done.get());
            assert_eq!(client.connect_error_code(), 0);
            assert!(client.connect_error().is_none());
            assert!(client.is_connected());
            assert!(client.local_addr().is_some());
            let (_accepted, peer) = listener.accept().unwrap();
            assert_eq!(Some(NetAddress::from(peer)), client.local_addr());
        })
        .join()
        .unwrap();
    }
}
