//! A single-threaded, readiness-driven scheduler.
//!
//! The reactor owns readers, writers, timers and background processes and
//! dispatches them from [`Reactor::step`]. Readiness comes from `mio`; since
//! mio is edge-triggered, every dispatched handle that stays registered is
//! re-armed so callbacks see the same level-triggered behaviour `select(2)`
//! would give them.
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};

use crate::error::{Error, ReactorError, ReactorResult, Result};

/// Priorities must be strictly below this value.
pub const MAX_PRIO: u8 = 10;
/// Priority used when none is given.
pub const DEFAULT_PRIO: u8 = 5;

/// Identifies something the reactor dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Handle {
    /// A socket-like file descriptor registered as reader and/or writer
    Fd(RawFd),
    /// A background process (see [`Reactor::add_process`])
    Process(u64),
}

/// Returned by [`Reactor::add_timer`], accepted by [`Reactor::remove_timer`].
///
/// Orders by deadline first and insertion order second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken {
    deadline: Instant,
    seq: u64,
}

type Callback = Rc<RefCell<dyn FnMut() -> Result<()>>>;
type TimerCallback = Box<dyn FnOnce() -> Result<()>>;

/// A registered callback with its priority and registration order.
struct Registration {
    callback: Callback,
    prio: u8,
    seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Reader,
    Writer,
    Process,
}

#[derive(Default)]
struct State {
    readers: HashMap<RawFd, Registration>,
    writers: HashMap<RawFd, Registration>,
    processes: HashMap<Handle, Registration>,
    suspended: HashMap<Handle, Registration>,
    timers: BTreeMap<TimerToken, TimerCallback>,
    /// What each fd is currently registered for with mio
    interests: HashMap<RawFd, Interest>,
    current: Option<(Handle, Kind)>,
    seq: u64,
    next_process: u64,
    running: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn map(&self, kind: Kind) -> &HashMap<RawFd, Registration> {
        match kind {
            Kind::Writer => &self.writers,
            _ => &self.readers,
        }
    }

    fn map_mut(&mut self, kind: Kind) -> &mut HashMap<RawFd, Registration> {
        match kind {
            Kind::Writer => &mut self.writers,
            _ => &mut self.readers,
        }
    }
}

/// Internal shared state for the reactor.
struct Shared {
    poll: RefCell<mio::Poll>,
    events: RefCell<Events>,
    /// Cloned from `poll` so registrations never contend with a running poll
    registry: mio::Registry,
    state: RefCell<State>,
    /// Tasks woken since the last step, see `compose`
    woken: Arc<Mutex<Vec<Handle>>>,
}

/// The scheduler. Cheap to clone; all clones drive the same state.
///
/// Not `Send`: everything registered runs on the thread that calls
/// [`step`](Reactor::step).
#[derive(Clone)]
pub struct Reactor {
    shared: Rc<Shared>,
}

pub(crate) fn validate_prio(prio: Option<u8>) -> ReactorResult<u8> {
    let prio = prio.unwrap_or(DEFAULT_PRIO);
    if prio >= MAX_PRIO {
        return Err(ReactorError::InvalidPriority(prio));
    }
    Ok(prio)
}

/// Registers `fd` for `interest`, falling back between register and
/// reregister when mio's view and ours disagree (an fd closed and reused
/// behind our back, for instance).
fn arm(registry: &mio::Registry, fd: RawFd, interest: Interest, fresh: bool) -> io::Result<()> {
    let token = Token(fd as usize);
    let mut source = SourceFd(&fd);
    let first = if fresh {
        registry.register(&mut source, token, interest)
    } else {
        registry.reregister(&mut source, token, interest)
    };
    match first {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            registry.reregister(&mut source, token, interest)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            registry.register(&mut source, token, interest)
        }
        other => other,
    }
}

/// Half-closes a descriptor the reactor does not own; the owner releases it.
fn shutdown_fd(fd: RawFd) {
    // SAFETY: shutdown(2) only changes socket state; a stale or non-socket fd
    // makes it fail with EBADF/ENOTSOCK, which is ignored.
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if ret == -1 {
        log::debug!("shutdown of fd {} failed: {}", fd, io::Error::last_os_error());
    }
}

impl Reactor {
    /// Creates a new reactor.
    ///
    /// # Errors
    /// Returns `ReactorError::Init` if the OS poller cannot be created.
    pub fn new() -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(|e| ReactorError::Init(Arc::new(e)))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| ReactorError::Init(Arc::new(e)))?;

        Ok(Reactor {
            shared: Rc::new(Shared {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(1024)),
                registry,
                state: RefCell::new(State::default()),
                woken: Arc::new(Mutex::new(Vec::new())),
            }),
        })
    }

    /// Calls `callback` whenever `source` is readable, until removed.
    ///
    /// # Errors
    /// - `ReactorError::InvalidPriority` for a priority `>= MAX_PRIO`
    /// - `ReactorError::Suspended` if the fd is currently suspended
    /// - `ReactorError::Registration` if mio refuses the descriptor
    pub fn add_reader<F>(&self, source: &impl AsRawFd, callback: F, prio: Option<u8>) -> ReactorResult<()>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add_fd(Kind::Reader, source.as_raw_fd(), Rc::new(RefCell::new(callback)), prio)
    }

    /// Calls `callback` whenever `source` is writable, until removed.
    ///
    /// Same errors as [`add_reader`](Reactor::add_reader).
    pub fn add_writer<F>(&self, source: &impl AsRawFd, callback: F, prio: Option<u8>) -> ReactorResult<()>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add_fd(Kind::Writer, source.as_raw_fd(), Rc::new(RefCell::new(callback)), prio)
    }

    fn add_fd(&self, kind: Kind, fd: RawFd, callback: Callback, prio: Option<u8>) -> ReactorResult<()> {
        let prio = validate_prio(prio)?;
        let replaced = {
            let mut state = self.shared.state.borrow_mut();
            if state.suspended.contains_key(&Handle::Fd(fd)) {
                return Err(ReactorError::Suspended(Handle::Fd(fd)));
            }
            let seq = state.next_seq();
            let replaced = state.map_mut(kind).insert(fd, Registration { callback, prio, seq });
            if let Err(err) = self.sync_interest(&mut state, fd) {
                state.map_mut(kind).remove(&fd);
                return Err(err);
            }
            replaced
        };
        drop(replaced);
        Ok(())
    }

    /// Stops watching `source` for readability. Returns `false` (and does
    /// nothing) when it was not registered as a reader.
    pub fn remove_reader(&self, source: &impl AsRawFd) -> bool {
        self.remove_fd(Kind::Reader, source.as_raw_fd())
    }

    /// Stops watching `source` for writability. Returns `false` (and does
    /// nothing) when it was not registered as a writer.
    pub fn remove_writer(&self, source: &impl AsRawFd) -> bool {
        self.remove_fd(Kind::Writer, source.as_raw_fd())
    }

    fn remove_fd(&self, kind: Kind, fd: RawFd) -> bool {
        let removed = {
            let mut state = self.shared.state.borrow_mut();
            let removed = state.map_mut(kind).remove(&fd);
            if removed.is_some() {
                if let Err(err) = self.sync_interest(&mut state, fd) {
                    log::debug!("re-registering fd {} after removal failed: {}", fd, err);
                }
            }
            removed
        };
        removed.is_some()
    }

    /// Calls `callback` once, `delay` from now.
    pub fn add_timer<F>(&self, delay: Duration, callback: F) -> TimerToken
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let mut state = self.shared.state.borrow_mut();
        let token = TimerToken {
            deadline: Instant::now() + delay,
            seq: state.next_seq(),
        };
        state.timers.insert(token, Box::new(callback));
        token
    }

    /// Cancels a timer. Returns `false` for a timer that already fired or
    /// was removed before.
    pub fn remove_timer(&self, token: TimerToken) -> bool {
        let removed = self.shared.state.borrow_mut().timers.remove(&token);
        removed.is_some()
    }

    /// Registers a background process, called on every step regardless of
    /// readiness.
    ///
    /// # Errors
    /// Returns `ReactorError::InvalidPriority` for a priority `>= MAX_PRIO`.
    pub fn add_process<F>(&self, callback: F, prio: Option<u8>) -> ReactorResult<Handle>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let prio = validate_prio(prio)?;
        let handle = self.new_process_handle();
        self.attach_process(handle, callback, prio);
        Ok(handle)
    }

    pub(crate) fn new_process_handle(&self) -> Handle {
        let mut state = self.shared.state.borrow_mut();
        state.next_process += 1;
        Handle::Process(state.next_process)
    }

    pub(crate) fn attach_process<F>(&self, handle: Handle, callback: F, prio: u8)
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let callback: Callback = Rc::new(RefCell::new(callback));
        let replaced = {
            let mut state = self.shared.state.borrow_mut();
            let seq = state.next_seq();
            state.processes.insert(handle, Registration { callback, prio, seq })
        };
        drop(replaced);
    }

    /// Removes a process, whether active or suspended. Returns `false` when
    /// it was not registered.
    pub fn remove_process(&self, handle: Handle) -> bool {
        let removed = {
            let mut state = self.shared.state.borrow_mut();
            let active = state.processes.remove(&handle);
            let suspended = match handle {
                Handle::Process(_) => state.suspended.remove(&handle),
                Handle::Fd(_) => None,
            };
            active.or(suspended)
        };
        removed.is_some()
    }

    /// Detaches the handle currently being dispatched from the poll set and
    /// returns it. It stays registered, but is not dispatched until one of
    /// the `resume_*` methods re-attaches it.
    ///
    /// # Errors
    /// Returns `ReactorError::NotDispatching` outside of a reader, writer or
    /// process callback.
    pub fn suspend(&self) -> ReactorResult<Handle> {
        let mut dropped = None;
        let handle = {
            let mut state = self.shared.state.borrow_mut();
            let (handle, kind) = state.current.ok_or(ReactorError::NotDispatching)?;
            if !state.suspended.contains_key(&handle) {
                let registration = match (kind, handle) {
                    (Kind::Reader, Handle::Fd(fd)) => {
                        dropped = state.writers.remove(&fd);
                        state.readers.remove(&fd)
                    }
                    (Kind::Writer, Handle::Fd(fd)) => {
                        dropped = state.readers.remove(&fd);
                        state.writers.remove(&fd)
                    }
                    _ => state.processes.remove(&handle),
                };
                if let Some(registration) = registration {
                    state.suspended.insert(handle, registration);
                }
                if let Handle::Fd(fd) = handle {
                    self.sync_interest(&mut state, fd)?;
                }
            }
            handle
        };
        drop(dropped);
        Ok(handle)
    }

    /// Re-attaches a suspended fd as a reader.
    pub fn resume_reader(&self, handle: Handle) -> ReactorResult<()> {
        self.resume(handle, Kind::Reader)
    }

    /// Re-attaches a suspended fd as a writer.
    pub fn resume_writer(&self, handle: Handle) -> ReactorResult<()> {
        self.resume(handle, Kind::Writer)
    }

    /// Re-attaches a suspended handle as a background process.
    pub fn resume_process(&self, handle: Handle) -> ReactorResult<()> {
        self.resume(handle, Kind::Process)
    }

    fn resume(&self, handle: Handle, kind: Kind) -> ReactorResult<()> {
        let mut state = self.shared.state.borrow_mut();
        if !state.suspended.contains_key(&handle) {
            return Err(ReactorError::NotSuspended(handle));
        }
        let fd = match (kind, handle) {
            (Kind::Process, _) => None,
            (_, Handle::Fd(fd)) => Some(fd),
            (_, Handle::Process(_)) => return Err(ReactorError::InvalidHandle(handle)),
        };
        let mut registration = state
            .suspended
            .remove(&handle)
            .ok_or(ReactorError::NotSuspended(handle))?;
        registration.seq = state.next_seq();
        match fd {
            Some(fd) => {
                state.map_mut(kind).insert(fd, registration);
                self.sync_interest(&mut state, fd)
            }
            None => {
                state.processes.insert(handle, registration);
                Ok(())
            }
        }
    }

    /// Whether `handle` is currently detached with [`suspend`](Reactor::suspend).
    pub fn is_suspended(&self, handle: Handle) -> bool {
        self.shared.state.borrow().suspended.contains_key(&handle)
    }

    /// Number of registered readers plus writers.
    pub fn open_connections(&self) -> usize {
        let state = self.shared.state.borrow();
        state.readers.len() + state.writers.len()
    }

    /// True when nothing is registered that a step could dispatch, so a
    /// blocking poll would never return.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.borrow();
        let woken = self.shared.woken.lock().map(|q| q.is_empty()).unwrap_or(true);
        woken
            && state.readers.is_empty()
            && state.writers.is_empty()
            && state.processes.is_empty()
            && state.timers.is_empty()
    }

    pub(crate) fn wake_queue(&self) -> Arc<Mutex<Vec<Handle>>> {
        self.shared.woken.clone()
    }

    /// Runs exactly one poll-and-dispatch cycle.
    ///
    /// Dispatch order within a step: due timers, then ready readers in
    /// ascending priority, then ready writers in ascending priority, then all
    /// processes in ascending priority. Within one priority, registration
    /// order wins. Registrations made during dispatch wait for the next
    /// step; removals take effect immediately.
    ///
    /// # Errors
    /// - `ReactorError::Polling` when the OS poller fails; this is fatal
    /// - any error returned by a callback, after its handle has been
    ///   unregistered and its socket shut down
    pub fn step(&self) -> Result<()> {
        self.resume_woken();
        let timeout = self.poll_timeout();

        {
            let mut poll = self.shared.poll.borrow_mut();
            let mut events = self.shared.events.borrow_mut();
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                log::error!("Polling error: {}", err);
                return Err(ReactorError::Polling(Arc::new(err)).into());
            }
        }

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        for event in self.shared.events.borrow().iter() {
            let fd = event.token().0 as RawFd;
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                readable.push(fd);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                writable.push(fd);
            }
        }

        let mark = self.shared.state.borrow_mut().next_seq();
        self.fire_timers()?;
        self.dispatch_fds(Kind::Reader, readable, mark)?;
        self.dispatch_fds(Kind::Writer, writable, mark)?;
        self.dispatch_processes(mark)?;
        Ok(())
    }

    /// Steps until [`stop`](Reactor::stop) is called, then shuts down.
    ///
    /// A failing callback is logged and the loop continues; only a polling
    /// failure ends it early.
    pub fn run(&self) -> Result<()> {
        self.shared.state.borrow_mut().running = true;
        let result = loop {
            if !self.shared.state.borrow().running {
                break Ok(());
            }
            match self.step() {
                Ok(()) => {}
                Err(Error::Reactor(err @ ReactorError::Polling(_))) => break Err(err.into()),
                Err(err) => log::error!("Reactor callback failed: {}", err),
            }
        };
        self.shutdown();
        result
    }

    /// Makes [`run`](Reactor::run) return after the current step.
    pub fn stop(&self) {
        self.shared.state.borrow_mut().running = false;
    }

    /// Shuts down every remaining reader, writer and suspended fd and clears
    /// all registrations. Anything left is logged, since at this point it
    /// is a leak.
    pub fn shutdown(&self) {
        let (readers, writers, suspended, processes, timers) = {
            let mut state = self.shared.state.borrow_mut();
            for fd in state.interests.keys() {
                let _ = self.shared.registry.deregister(&mut SourceFd(fd));
            }
            state.interests.clear();
            state.current = None;
            (
                std::mem::take(&mut state.readers),
                std::mem::take(&mut state.writers),
                std::mem::take(&mut state.suspended),
                std::mem::take(&mut state.processes),
                std::mem::take(&mut state.timers),
            )
        };

        for fd in readers.keys() {
            log::warn!("Reactor shutdown: closing reader fd {}", fd);
            shutdown_fd(*fd);
        }
        for fd in writers.keys() {
            log::warn!("Reactor shutdown: closing writer fd {}", fd);
            shutdown_fd(*fd);
        }
        for handle in suspended.keys() {
            log::warn!("Reactor shutdown: dropping suspended {:?}", handle);
            if let Handle::Fd(fd) = handle {
                shutdown_fd(*fd);
            }
        }
        if !processes.is_empty() {
            log::warn!("Reactor shutdown: dropping {} process(es)", processes.len());
        }
        if let Ok(mut woken) = self.shared.woken.lock() {
            woken.clear();
        }

        // Dropped only now: callbacks may own futures whose destructors call
        // back into the reactor.
        drop((readers, writers, suspended, processes, timers));
    }

    /// Keeps mio's registration for `fd` in line with the reader/writer maps.
    fn sync_interest(&self, state: &mut State, fd: RawFd) -> ReactorResult<()> {
        let wanted = match (state.readers.contains_key(&fd), state.writers.contains_key(&fd)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        match wanted {
            Some(interest) => {
                let fresh = !state.interests.contains_key(&fd);
                arm(&self.shared.registry, fd, interest, fresh)
                    .map_err(|e| ReactorError::Registration(Arc::new(e)))?;
                state.interests.insert(fd, interest);
            }
            None => {
                if state.interests.remove(&fd).is_some() {
                    // Fails harmlessly when the owner already closed the fd.
                    let _ = self.shared.registry.deregister(&mut SourceFd(&fd));
                }
            }
        }
        Ok(())
    }

    fn rearm(&self, fd: RawFd) {
        let interest = self.shared.state.borrow().interests.get(&fd).copied();
        if let Some(interest) = interest {
            if let Err(err) = arm(&self.shared.registry, fd, interest, false) {
                log::debug!("re-arming fd {} failed: {}", fd, err);
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let state = self.shared.state.borrow();
        if !state.processes.is_empty() {
            return Some(Duration::ZERO);
        }
        state
            .timers
            .keys()
            .next()
            .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
    }

    fn resume_woken(&self) {
        let woken = match self.shared.woken.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in woken {
            if self.is_suspended(handle) {
                if let Err(err) = self.resume_process(handle) {
                    log::debug!("resuming woken {:?} failed: {}", handle, err);
                }
            }
        }
    }

    fn fire_timers(&self) -> Result<()> {
        let now = Instant::now();
        let due: Vec<TimerToken> = self
            .shared
            .state
            .borrow()
            .timers
            .keys()
            .take_while(|timer| timer.deadline <= now)
            .copied()
            .collect();

        for token in due {
            let callback = self.shared.state.borrow_mut().timers.remove(&token);
            if let Some(callback) = callback {
                callback()?;
            }
        }
        Ok(())
    }

    fn dispatch_fds(&self, kind: Kind, mut ready: Vec<RawFd>, mark: u64) -> Result<()> {
        ready.sort_unstable();
        ready.dedup();

        let mut order: Vec<(u8, u64, RawFd)> = {
            let state = self.shared.state.borrow();
            let map = state.map(kind);
            ready
                .into_iter()
                .filter_map(|fd| {
                    map.get(&fd)
                        .filter(|registration| registration.seq < mark)
                        .map(|registration| (registration.prio, registration.seq, fd))
                })
                .collect()
        };
        order.sort_unstable();

        for (_, seq, fd) in order {
            let callback = {
                let state = self.shared.state.borrow();
                match state.map(kind).get(&fd) {
                    Some(registration) if registration.seq == seq => registration.callback.clone(),
                    _ => continue,
                }
            };
            self.invoke(Handle::Fd(fd), kind, &callback)?;
            self.rearm(fd);
        }
        Ok(())
    }

    fn dispatch_processes(&self, mark: u64) -> Result<()> {
        let mut order: Vec<(u8, u64, Handle)> = self
            .shared
            .state
            .borrow()
            .processes
            .iter()
            .filter(|(_, registration)| registration.seq < mark)
            .map(|(handle, registration)| (registration.prio, registration.seq, *handle))
            .collect();
        order.sort_unstable();

        for (_, seq, handle) in order {
            let callback = {
                let state = self.shared.state.borrow();
                match state.processes.get(&handle) {
                    Some(registration) if registration.seq == seq => registration.callback.clone(),
                    _ => continue,
                }
            };
            self.invoke(handle, Kind::Process, &callback)?;
        }
        Ok(())
    }

    fn invoke(&self, handle: Handle, kind: Kind, callback: &Callback) -> Result<()> {
        self.shared.state.borrow_mut().current = Some((handle, kind));
        let result = match callback.try_borrow_mut() {
            Ok(mut callback) => (&mut *callback)(),
            // Already running further up the stack.
            Err(_) => Ok(()),
        };
        self.shared.state.borrow_mut().current = None;

        if let Err(err) = result {
            log::error!("Callback for {:?} failed: {}", handle, err);
            self.discard(handle);
            return Err(err);
        }
        Ok(())
    }

    /// Unregisters a misbehaving handle and shuts its socket down.
    fn discard(&self, handle: Handle) {
        let removed = {
            let mut state = self.shared.state.borrow_mut();
            let mut removed = Vec::new();
            removed.extend(state.suspended.remove(&handle));
            match handle {
                Handle::Fd(fd) => {
                    removed.extend(state.readers.remove(&fd));
                    removed.extend(state.writers.remove(&fd));
                    let _ = self.sync_interest(&mut state, fd);
                }
                Handle::Process(_) => removed.extend(state.processes.remove(&handle)),
            }
            removed
        };
        if let Handle::Fd(fd) = handle {
            shutdown_fd(fd);
        }
        drop(removed);
    }

    /// Resolves once `source` is readable.
    pub fn readable(&self, source: &impl AsRawFd, prio: Option<u8>) -> Readiness {
        Readiness::new(self.clone(), source.as_raw_fd(), Kind::Reader, prio)
    }

    /// Resolves once `source` is writable.
    pub fn writable(&self, source: &impl AsRawFd, prio: Option<u8>) -> Readiness {
        Readiness::new(self.clone(), source.as_raw_fd(), Kind::Writer, prio)
    }

    /// Resolves after `delay`.
    pub fn sleep(&self, delay: Duration) -> Sleep {
        Sleep {
            reactor: self.clone(),
            delay,
            token: None,
            signal: Rc::new(Signal::default()),
        }
    }
}

/// Fired flag plus the waker to notify, shared between a future and the
/// one-shot callback it registered.
#[derive(Default)]
struct Signal {
    fired: std::cell::Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Signal {
    fn fire(&self) {
        self.fired.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Future returned by [`Reactor::readable`] and [`Reactor::writable`].
///
/// Registers a one-shot reader or writer on first poll; dropping it before
/// it fires withdraws the registration.
pub struct Readiness {
    reactor: Reactor,
    fd: RawFd,
    kind: Kind,
    prio: Option<u8>,
    armed: bool,
    signal: Rc<Signal>,
}

impl Readiness {
    fn new(reactor: Reactor, fd: RawFd, kind: Kind, prio: Option<u8>) -> Self {
        Readiness {
            reactor,
            fd,
            kind,
            prio,
            armed: false,
            signal: Rc::new(Signal::default()),
        }
    }
}

impl Future for Readiness {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.signal.fired.get() {
            this.armed = false;
            return Poll::Ready(Ok(()));
        }
        *this.signal.waker.borrow_mut() = Some(cx.waker().clone());

        if !this.armed {
            let signal = this.signal.clone();
            let reactor = this.reactor.clone();
            let (fd, kind) = (this.fd, this.kind);
            let callback = move || {
                reactor.remove_fd(kind, fd);
                signal.fire();
                Ok(())
            };
            let added = match kind {
                Kind::Writer => this.reactor.add_writer(&fd, callback, this.prio),
                _ => this.reactor.add_reader(&fd, callback, this.prio),
            };
            if let Err(err) = added {
                return Poll::Ready(Err(err.into()));
            }
            this.armed = true;
        }
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if self.armed && !self.signal.fired.get() {
            self.reactor.remove_fd(self.kind, self.fd);
        }
    }
}

/// Future returned by [`Reactor::sleep`].
pub struct Sleep {
    reactor: Reactor,
    delay: Duration,
    token: Option<TimerToken>,
    signal: Rc<Signal>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.signal.fired.get() {
            this.token = None;
            return Poll::Ready(());
        }
        *this.signal.waker.borrow_mut() = Some(cx.waker().clone());

        if this.token.is_none() {
            let signal = this.signal.clone();
            this.token = Some(this.reactor.add_timer(this.delay, move || {
                signal.fire();
                Ok(())
            }));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.reactor.remove_timer(token);
        }
    }
}
