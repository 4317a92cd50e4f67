//! EventLoop: reactor satu-thread di atas mio
//!
//! Siklus per iterasi:
//! 1. Poll dengan timeout = waktu sampai timer terdekat (atau tanpa batas)
//! 2. Jalankan callback readable/writable untuk setiap fd yang ready
//! 3. Jalankan semua timer yang sudah jatuh tempo, jadwalkan ulang yang repeating
//!
//! Satu-satunya jalur masuk dari thread lain adalah `LoopHandle`: task
//! dikirim lewat channel lalu loop dibangunkan dengan `mio::Waker`.
//! Semua state lain hanya disentuh thread pemilik (`EventLoop` sengaja `!Send`).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace, warn};

use super::fd_event::{Callback, FdEvent};
use super::timer::{run_expired, TimerEvent, TimerHandle, TimerQueue};
use crate::error::{NetError, Result};

/// Token khusus untuk waker, tidak pernah dibagikan ke fd
const WAKER_TOKEN: Token = Token(usize::MAX);

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Task lintas-thread, dijalankan di thread loop tujuan
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    // Satu loop per thread
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

struct Registration {
    interest: Interest,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
}

struct LoopInner {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    registrations: RefCell<HashMap<Token, Registration>>,
    // Token dibagikan per registrasi, bukan per fd: fd yang dipakai ulang
    // dalam batch poll yang sama tidak menerima event milik socket lama
    tokens: RefCell<HashMap<RawFd, Token>>,
    next_token: Cell<usize>,
    timers: RefCell<TimerQueue>,
    tasks: Receiver<Task>,
    wakeup_hooks: RefCell<Vec<Callback>>,
    handle: LoopHandle,
    looping: Cell<bool>,
}

/// Reactor milik satu thread. Clone murah (shared pointer ke state yang sama).
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Handle `Send + Clone` untuk berinteraksi dengan loop dari thread lain
#[derive(Clone)]
pub struct LoopHandle {
    waker: Arc<Waker>,
    tasks: Sender<Task>,
    stop: Arc<AtomicBool>,
    thread_id: ThreadId,
}

impl LoopHandle {
    /// Kirim task ke loop lalu bangunkan loop-nya
    pub fn run_in_loop<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event loop is gone"))?;
        self.wakeup()
    }

    /// Jadwalkan timer di loop tujuan. Handle bisa di-cancel dari thread mana pun.
    pub fn add_timer<F>(&self, due: Instant, interval: Duration, task: F) -> Result<TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let handle = TimerHandle::new();
        let timer_handle = handle.clone();
        self.run_in_loop(move |event_loop| {
            event_loop.add_timer_event(TimerEvent::with_handle(due, interval, task, timer_handle));
        })?;
        Ok(handle)
    }

    /// Tulis ke wake channel
    pub fn wakeup(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }

    /// Minta loop berhenti setelah iterasi sekarang
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake event loop for stop");
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl EventLoop {
    /// Membuat loop untuk thread ini.
    ///
    /// Error kalau thread ini sudah punya loop: satu loop per thread.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    pub fn with_capacity(events_capacity: usize) -> Result<Self> {
        let bound = CURRENT.with(|current| current.borrow().is_some());
        if bound {
            return Err(NetError::LoopAlreadyBound(format!(
                "{:?}",
                thread::current().id()
            )));
        }

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(&registry, WAKER_TOKEN)?);
        let (tx, rx) = unbounded();

        let handle = LoopHandle {
            waker,
            tasks: tx,
            stop: Arc::new(AtomicBool::new(false)),
            thread_id: thread::current().id(),
        };

        let event_loop = EventLoop {
            inner: Rc::new(LoopInner {
                poll: RefCell::new(poll),
                registry,
                events: RefCell::new(Events::with_capacity(events_capacity.max(1))),
                registrations: RefCell::new(HashMap::new()),
                tokens: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
                timers: RefCell::new(TimerQueue::new()),
                tasks: rx,
                wakeup_hooks: RefCell::new(Vec::new()),
                handle,
                looping: Cell::new(false),
            }),
        };

        CURRENT.with(|current| *current.borrow_mut() = Some(event_loop.clone()));
        debug!(thread = ?thread::current().id(), "event loop created");
        Ok(event_loop)
    }

    /// Loop milik thread ini, dibuat kalau belum ada
    pub fn current() -> Result<Self> {
        if let Some(existing) = CURRENT.with(|current| current.borrow().clone()) {
            return Ok(existing);
        }
        Self::new()
    }

    pub fn handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    pub fn is_looping(&self) -> bool {
        self.inner.looping.get()
    }

    /// Arm interest set fd ini ke multiplexer, atau ganti callback-nya
    /// kalau sudah terdaftar. FdEvent tanpa interest dilepas dari multiplexer.
    pub fn add_event(&self, fd_event: &FdEvent) -> io::Result<()> {
        let Some(interest) = fd_event.interest() else {
            return self.delete_event(fd_event);
        };

        let fd = fd_event.fd();
        let known = self.inner.tokens.borrow().get(&fd).copied();
        let mut registrations = self.inner.registrations.borrow_mut();

        let existing = match known {
            Some(token) => registrations.get_mut(&token).map(|reg| (token, reg)),
            None => None,
        };

        match existing {
            Some((token, existing)) => {
                if existing.interest != interest {
                    self.inner
                        .registry
                        .reregister(&mut SourceFd(&fd), token, interest)?;
                }
                existing.interest = interest;
                existing.on_read = fd_event.read_callback();
                existing.on_write = fd_event.write_callback();
            }
            None => {
                let token = self.allocate_token(&registrations);
                self.inner
                    .registry
                    .register(&mut SourceFd(&fd), token, interest)?;
                self.inner.tokens.borrow_mut().insert(fd, token);
                registrations.insert(
                    token,
                    Registration {
                        interest,
                        on_read: fd_event.read_callback(),
                        on_write: fd_event.write_callback(),
                    },
                );
            }
        }

        trace!(fd, ?interest, "fd event armed");
        Ok(())
    }

    /// Lepas fd dari multiplexer. Aman dipanggil berkali-kali.
    pub fn delete_event(&self, fd_event: &FdEvent) -> io::Result<()> {
        self.delete_fd(fd_event.fd())
    }

    pub(crate) fn delete_fd(&self, fd: RawFd) -> io::Result<()> {
        let Some(token) = self.inner.tokens.borrow_mut().remove(&fd) else {
            return Ok(());
        };
        let removed = self.inner.registrations.borrow_mut().remove(&token);
        if removed.is_some() {
            self.inner.registry.deregister(&mut SourceFd(&fd))?;
            trace!(fd, "fd event deleted");
        }
        Ok(())
    }

    /// Apakah fd ini sedang terdaftar di loop
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.tokens.borrow().contains_key(&fd)
    }

    fn token_of(&self, fd: RawFd) -> Option<Token> {
        self.inner.tokens.borrow().get(&fd).copied()
    }

    /// Token berikutnya yang tidak sedang dipakai (wrap, lewati waker)
    fn allocate_token(&self, registrations: &HashMap<Token, Registration>) -> Token {
        loop {
            let id = self.inner.next_token.get();
            self.inner.next_token.set(id.wrapping_add(1));
            let token = Token(id);
            if token != WAKER_TOKEN && !registrations.contains_key(&token) {
                return token;
            }
        }
    }

    /// Tambah timer ke queue loop ini
    pub fn add_timer_event(&self, event: TimerEvent) -> TimerHandle {
        self.inner.timers.borrow_mut().push(event)
    }

    /// One-shot timer setelah `delay`
    pub fn run_after<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        self.add_timer_event(TimerEvent::new(Instant::now() + delay, Duration::ZERO, task))
    }

    /// Timer repeating, pertama kali jalan setelah `interval`
    pub fn run_every<F>(&self, interval: Duration, task: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        self.add_timer_event(TimerEvent::new(Instant::now() + interval, interval, task))
    }

    /// Hook yang dijalankan setiap kali loop dibangunkan lewat wake channel
    pub fn add_wakeup_hook<F>(&self, hook: F)
    where
        F: Fn() + 'static,
    {
        self.inner.wakeup_hooks.borrow_mut().push(Rc::new(hook));
    }

    /// Jalankan reactor sampai `stop()` dipanggil.
    ///
    /// Setelah return, stop flag di-reset sehingga loop bisa dijalankan lagi.
    pub fn run(&self) -> Result<()> {
        let stop = self.inner.handle.stop.clone();
        self.inner.looping.set(true);
        debug!(thread = ?thread::current().id(), "event loop running");

        let result = (|| -> Result<()> {
            while !stop.load(Ordering::Acquire) {
                let timeout = self.inner.timers.borrow_mut().poll_timeout(Instant::now());

                let ready = match self.poll_ready(timeout) {
                    Ok(ready) => ready,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        return Err(e.into());
                    }
                };

                for (token, readable, writable) in ready {
                    if token == WAKER_TOKEN {
                        self.drain_wakeup();
                        continue;
                    }
                    self.dispatch(token, readable, writable);
                }

                self.drain_timers();
            }
            Ok(())
        })();

        stop.store(false, Ordering::Release);
        self.inner.looping.set(false);
        debug!(thread = ?thread::current().id(), "event loop stopped");
        result
    }

    /// Minta loop berhenti (dari thread loop sendiri)
    pub fn stop(&self) {
        self.inner.handle.stop();
    }

    fn poll_ready(&self, timeout: Option<Duration>) -> io::Result<Vec<(Token, bool, bool)>> {
        let mut poll = self.inner.poll.borrow_mut();
        let mut events = self.inner.events.borrow_mut();
        poll.poll(&mut events, timeout)?;

        Ok(events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable =
                    event.is_writable() || event.is_write_closed() || event.is_error();
                (event.token(), readable, writable)
            })
            .collect())
    }

    fn dispatch(&self, token: Token, readable: bool, writable: bool) {
        // Lookup ulang sebelum tiap callback: callback sebelumnya bisa saja
        // sudah menghapus registrasi fd ini.
        if readable {
            let callback = self
                .inner
                .registrations
                .borrow()
                .get(&token)
                .and_then(|reg| reg.on_read.clone());
            if let Some(callback) = callback {
                callback();
            }
        }

        if writable {
            let callback = self
                .inner
                .registrations
                .borrow()
                .get(&token)
                .and_then(|reg| reg.on_write.clone());
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn drain_wakeup(&self) {
        while let Ok(task) = self.inner.tasks.try_recv() {
            task(self);
        }
        let hooks: Vec<Callback> = self.inner.wakeup_hooks.borrow().clone();
        for hook in hooks {
            hook();
        }
    }

    fn drain_timers(&self) {
        let now = Instant::now();
        let expired = self.inner.timers.borrow_mut().pop_expired(now);
        if expired.is_empty() {
            return;
        }
        let again = run_expired(expired, now);
        let mut timers = self.inner.timers.borrow_mut();
        for event in again {
            timers.push(event);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.inner.handle.thread_id)
            .field("looping", &self.inner.looping.get())
            .field("registered", &self.inner.registrations.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fd_event::FdInterest;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_one_loop_per_thread() {
        thread::spawn(|| {
            let first = EventLoop::new().unwrap();
            assert!(matches!(
                EventLoop::new(),
                Err(NetError::LoopAlreadyBound(_))
            ));
            let current = EventLoop::current().unwrap();
            assert!(Rc::ptr_eq(&first.inner, &current.inner));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_timer_fires_and_stops_loop() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let fired = Rc::new(Cell::new(0));

            let f = fired.clone();
            let lp = event_loop.clone();
            event_loop.run_after(Duration::from_millis(20), move || {
                f.set(f.get() + 1);
                lp.stop();
            });

            let start = Instant::now();
            event_loop.run().unwrap();
            assert_eq!(fired.get(), 1);
            assert!(start.elapsed() >= Duration::from_millis(20));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_repeating_timer_until_cancelled() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let ticks = Rc::new(Cell::new(0));
            let at_cancel = Rc::new(Cell::new(None));

            let t = ticks.clone();
            let handle = event_loop.run_every(Duration::from_millis(5), move || {
                t.set(t.get() + 1);
            });

            let lp = event_loop.clone();
            let t = ticks.clone();
            let c = at_cancel.clone();
            event_loop.run_every(Duration::from_millis(2), move || {
                if t.get() >= 3 && c.get().is_none() {
                    handle.cancel();
                    c.set(Some(t.get()));
                    let stopper = lp.clone();
                    lp.run_after(Duration::from_millis(30), move || stopper.stop());
                }
            });

            event_loop.run().unwrap();
            let cancelled_at = at_cancel.get().unwrap();
            assert!(cancelled_at >= 3);
            assert_eq!(ticks.get(), cancelled_at);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cross_thread_task_runs_on_loop_thread() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = thread::spawn(move || {
            let event_loop = EventLoop::current().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run().unwrap();
        });

        let handle = rx.recv().unwrap();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let expected = handle.thread_id();
        handle
            .run_in_loop(move |event_loop| {
                done_tx.send(thread::current().id()).unwrap();
                event_loop.stop();
            })
            .unwrap();

        assert_eq!(done_rx.recv().unwrap(), expected);
        worker.join().unwrap();
    }

    #[test]
    fn test_cross_thread_timer() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = thread::spawn(move || {
            let event_loop = EventLoop::current().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run().unwrap();
        });

        let handle = rx.recv().unwrap();
        let (fired_tx, fired_rx) = crossbeam_channel::bounded(1);
        let stopper = handle.clone();
        handle
            .add_timer(
                Instant::now() + Duration::from_millis(10),
                Duration::ZERO,
                move || {
                    let _ = fired_tx.send(());
                    stopper.stop();
                },
            )
            .unwrap();

        fired_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer did not fire");
        worker.join().unwrap();
    }

    #[test]
    fn test_readable_callback_and_delete_is_idempotent() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            let (server_side, _) = listener.accept().unwrap();

            let mut fd_event = FdEvent::new(server_side.as_raw_fd()).unwrap();
            let hits = Rc::new(Cell::new(0));
            let h = hits.clone();
            let lp = event_loop.clone();
            fd_event.listen(FdInterest::Readable, move || {
                h.set(h.get() + 1);
                lp.stop();
            });
            event_loop.add_event(&fd_event).unwrap();
            assert!(event_loop.is_registered(fd_event.fd()));

            client.write_all(b"x").unwrap();
            event_loop.run().unwrap();
            assert_eq!(hits.get(), 1);

            event_loop.delete_event(&fd_event).unwrap();
            event_loop.delete_event(&fd_event).unwrap();
            assert!(!event_loop.is_registered(fd_event.fd()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_stale_token_after_reregister_is_ignored() {
        thread::spawn(|| {
            let event_loop = EventLoop::current().unwrap();
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let (server_side, _) = listener.accept().unwrap();

            let mut first = FdEvent::new(server_side.as_raw_fd()).unwrap();
            first.listen(FdInterest::Readable, || {});
            event_loop.add_event(&first).unwrap();
            let old_token = event_loop.token_of(first.fd()).unwrap();
            event_loop.delete_event(&first).unwrap();

            // Fd yang sama didaftarkan ulang oleh pemilik baru
            let hits = Rc::new(Cell::new(0));
            let h = hits.clone();
            let mut second = FdEvent::new(server_side.as_raw_fd()).unwrap();
            second.listen(FdInterest::Readable, move || h.set(h.get() + 1));
            event_loop.add_event(&second).unwrap();
            let new_token = event_loop.token_of(second.fd()).unwrap();
            assert_ne!(old_token, new_token);

            // Event sisa dari batch lama tidak sampai ke callback baru
            event_loop.dispatch(old_token, true, true);
            assert_eq!(hits.get(), 0);
            event_loop.dispatch(new_token, true, false);
            assert_eq!(hits.get(), 1);
        })
        .join()
        .unwrap();
    }
}
