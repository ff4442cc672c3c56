//! One-shot continuations.
//!
//! A [`Suspend`] detaches whatever the reactor is dispatching, hands control
//! to a driving callback, and settles exactly once with a value or an error,
//! optionally on a timeout. [`Suspend::wait`] turns it into a future for use
//! inside tasks.
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::{Error, ReactorResult, Result};
use crate::reactor::{Handle, Reactor, TimerToken};

type DoNext<T> = Box<dyn FnOnce(&Suspend<T>) -> Result<()>>;
type OnTimeout = Box<dyn FnOnce() -> Result<()>>;

enum Outcome<T> {
    Unsettled,
    Resolved(T),
    Failed(Error),
}

struct Inner<T> {
    do_next: Option<DoNext<T>>,
    timeout: Option<Duration>,
    on_timeout: Option<OnTimeout>,
    outcome: Outcome<T>,
    timer: Option<TimerToken>,
    reactor: Option<Reactor>,
    handle: Option<Handle>,
    when_done: Option<Box<dyn FnOnce()>>,
}

/// A continuation that settles once, with a value or an error.
///
/// Clones share the same state.
pub struct Suspend<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Suspend<T> {
    fn clone(&self) -> Self {
        Suspend {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Suspend<T> {
    /// A continuation without timeout, driven by `do_next` when entered.
    pub fn new<F>(do_next: F) -> Self
    where
        F: FnOnce(&Suspend<T>) -> Result<()> + 'static,
    {
        Self::build(Box::new(do_next), None, None)
    }

    /// A continuation that fails with [`Error::Timeout`] unless settled
    /// within `timeout`. `on_timeout` runs first, to release whatever the
    /// driving side holds.
    pub fn with_timeout<F, G>(do_next: F, timeout: Duration, on_timeout: G) -> Self
    where
        F: FnOnce(&Suspend<T>) -> Result<()> + 'static,
        G: FnOnce() -> Result<()> + 'static,
    {
        Self::build(Box::new(do_next), Some(timeout), Some(Box::new(on_timeout)))
    }

    fn build(do_next: DoNext<T>, timeout: Option<Duration>, on_timeout: Option<OnTimeout>) -> Self {
        Suspend {
            inner: Rc::new(RefCell::new(Inner {
                do_next: Some(do_next),
                timeout,
                on_timeout,
                outcome: Outcome::Unsettled,
                timer: None,
                reactor: None,
                handle: None,
                when_done: None,
            })),
        }
    }

    /// Enters the continuation: runs the driving callback once, then (unless
    /// it already settled) starts the timeout and detaches the handle the
    /// reactor is dispatching. `when_done` runs when it settles.
    ///
    /// A failing driving callback settles the continuation with its error.
    pub fn call<W>(&self, reactor: &Reactor, when_done: W)
    where
        W: FnOnce() + 'static,
    {
        let do_next = {
            let mut inner = self.inner.borrow_mut();
            inner.reactor = Some(reactor.clone());
            inner.when_done = Some(Box::new(when_done));
            inner.do_next.take()
        };

        if let Some(do_next) = do_next {
            if let Err(err) = do_next(self) {
                let mut inner = self.inner.borrow_mut();
                if matches!(inner.outcome, Outcome::Unsettled) {
                    inner.outcome = Outcome::Failed(err);
                    inner.when_done = None;
                }
                return;
            }
        }
        if self.is_settled() {
            return;
        }

        let timeout = self.inner.borrow().timeout;
        if let Some(timeout) = timeout {
            let this = self.clone();
            let token = reactor.add_timer(timeout, move || this.timed_out());
            self.inner.borrow_mut().timer = Some(token);
        }
        // Outside of dispatch there is nothing to detach.
        let handle = reactor.suspend().ok();
        self.inner.borrow_mut().handle = handle;
    }

    /// Settles with a value.
    ///
    /// # Errors
    /// Returns [`Error::AlreadySettled`] if it was settled before.
    pub fn resume(&self, value: T) -> Result<()> {
        self.settle(Outcome::Resolved(value))
    }

    /// Settles with an error.
    ///
    /// # Errors
    /// Returns [`Error::AlreadySettled`] if it was settled before.
    pub fn throw(&self, err: Error) -> Result<()> {
        self.settle(Outcome::Failed(err))
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<()> {
        let (timer, reactor, when_done) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.outcome, Outcome::Unsettled) {
                return Err(Error::AlreadySettled);
            }
            inner.outcome = outcome;
            (inner.timer.take(), inner.reactor.clone(), inner.when_done.take())
        };
        if let (Some(timer), Some(reactor)) = (timer, reactor) {
            reactor.remove_timer(timer);
        }
        if let Some(when_done) = when_done {
            when_done();
        }
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().outcome, Outcome::Unsettled)
    }

    /// Re-attaches the detached handle as a reader. No-op when nothing was
    /// detached.
    pub fn resume_reader(&self) -> ReactorResult<()> {
        self.reattach(Reactor::resume_reader)
    }

    /// Re-attaches the detached handle as a writer.
    pub fn resume_writer(&self) -> ReactorResult<()> {
        self.reattach(Reactor::resume_writer)
    }

    /// Re-attaches the detached handle as a process.
    pub fn resume_process(&self) -> ReactorResult<()> {
        self.reattach(Reactor::resume_process)
    }

    fn reattach(&self, resume: fn(&Reactor, Handle) -> ReactorResult<()>) -> ReactorResult<()> {
        let (reactor, handle) = {
            let inner = self.inner.borrow();
            (inner.reactor.clone(), inner.handle)
        };
        match (reactor, handle) {
            (Some(reactor), Some(handle)) => resume(&reactor, handle),
            _ => Ok(()),
        }
    }

    fn timed_out(&self) -> Result<()> {
        let on_timeout = {
            let mut inner = self.inner.borrow_mut();
            inner.timer = None;
            inner.on_timeout.take()
        };
        if let Some(on_timeout) = on_timeout {
            if let Err(err) = on_timeout() {
                log::error!("Unexpected error in Suspend on_timeout callback (ignored): {}", err);
            }
        }
        if self.is_settled() {
            return Ok(());
        }
        self.throw(Error::Timeout)
    }

    /// A future resolving to the settled outcome. The first poll enters the
    /// continuation.
    pub fn wait(&self, reactor: &Reactor) -> Wait<T> {
        Wait {
            suspend: self.clone(),
            reactor: reactor.clone(),
            waker: Rc::new(RefCell::new(None)),
            entered: false,
        }
    }
}

impl<T: Clone + 'static> Suspend<T> {
    /// The settled value, or the settled error. Idempotent.
    ///
    /// # Errors
    /// The error it was thrown, or [`Error::NotSettled`] before settlement.
    pub fn get_result(&self) -> Result<T> {
        match &self.inner.borrow().outcome {
            Outcome::Unsettled => Err(Error::NotSettled),
            Outcome::Resolved(value) => Ok(value.clone()),
            Outcome::Failed(err) => Err(err.clone()),
        }
    }
}

/// Future returned by [`Suspend::wait`].
pub struct Wait<T> {
    suspend: Suspend<T>,
    reactor: Reactor,
    waker: Rc<RefCell<Option<Waker>>>,
    entered: bool,
}

impl<T: Clone + 'static> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = self.get_mut();
        *this.waker.borrow_mut() = Some(cx.waker().clone());

        if !this.entered {
            this.entered = true;
            let waker = this.waker.clone();
            this.suspend.call(&this.reactor, move || {
                if let Some(waker) = waker.borrow_mut().take() {
                    waker.wake();
                }
            });
        }

        if this.suspend.is_settled() {
            Poll::Ready(this.suspend.get_result())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramingError;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_resume_settles_once() {
        let suspend: Suspend<u32> = Suspend::new(|_| Ok(()));
        assert!(matches!(suspend.get_result(), Err(Error::NotSettled)));

        suspend.resume(42).unwrap();
        assert_eq!(suspend.get_result().unwrap(), 42);
        assert_eq!(suspend.get_result().unwrap(), 42);

        assert!(matches!(suspend.resume(43), Err(Error::AlreadySettled)));
        assert!(matches!(suspend.throw(Error::Timeout), Err(Error::AlreadySettled)));
        assert_eq!(suspend.get_result().unwrap(), 42);
    }

    #[test]
    fn test_throw_reports_same_error_twice() {
        let suspend: Suspend<()> = Suspend::new(|_| Ok(()));
        suspend.throw(FramingError::PrematureClose.into()).unwrap();

        for _ in 0..2 {
            let err = suspend.get_result().unwrap_err();
            assert!(matches!(err, Error::Framing(FramingError::PrematureClose)));
        }
        assert!(matches!(suspend.resume(()), Err(Error::AlreadySettled)));
    }

    /// A failing driving callback settles the continuation with its error.
    #[test]
    fn test_failing_do_next() {
        let reactor = Reactor::new().unwrap();
        let suspend: Suspend<u8> = Suspend::new(|_| Err(Error::Config("bad".into())));
        let done = Rc::new(Cell::new(false));

        let d = done.clone();
        suspend.call(&reactor, move || d.set(true));
        assert!(matches!(suspend.get_result(), Err(Error::Config(_))));
        assert!(!done.get());
    }

    /// The callback style: a reader detaches itself and is resumed later.
    #[test]
    fn test_suspend_reader_and_resume() {
        let reactor = Reactor::new().unwrap();
        let (sok, mut peer) = UnixStream::pair().unwrap();
        peer.write_all(b"x").unwrap();

        let suspend: Suspend<&'static str> = Suspend::new(|_| Ok(()));
        let calls = Rc::new(Cell::new(0));
        let done = Rc::new(Cell::new(false));

        let (r, s, c, d) = (reactor.clone(), suspend.clone(), calls.clone(), done.clone());
        let mut entered = false;
        reactor.add_reader(&sok, move || {
            c.set(c.get() + 1);
            if !entered {
                entered = true;
                let d = d.clone();
                s.call(&r, move || d.set(true));
            }
            Ok(())
        }, None).unwrap();

        reactor.step().unwrap();
        assert_eq!(calls.get(), 1);
        assert!(reactor.is_suspended(Handle::Fd(sok.as_raw_fd())));

        suspend.resume("hello").unwrap();
        assert!(done.get());
        assert_eq!(suspend.get_result().unwrap(), "hello");

        suspend.resume_reader().unwrap();
        assert!(!reactor.is_suspended(Handle::Fd(sok.as_raw_fd())));
        reactor.step().unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_wait_resolves_from_other_task() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let suspend: Suspend<u32> = Suspend::new(move |s| {
            let s = s.clone();
            let r2 = r.clone();
            crate::compose::spawn(&r, async move {
                r2.sleep(Duration::from_millis(2)).await;
                let _ = s.resume(7);
            });
            Ok(())
        });

        let result = reactor.block_on({
            let r = reactor.clone();
            async move { suspend.wait(&r).await }
        });
        assert_eq!(result.unwrap().unwrap(), 7);
    }

    /// A timeout runs on_timeout first, then fails the continuation; errors
    /// from on_timeout are only logged.
    #[test]
    fn test_timeout() {
        let reactor = Reactor::new().unwrap();
        let cleaned = Rc::new(Cell::new(false));

        let c = cleaned.clone();
        let suspend: Suspend<()> = Suspend::with_timeout(
            |_| Ok(()),
            Duration::from_millis(10),
            move || {
                c.set(true);
                Err(Error::Config("cleanup failed".into()))
            },
        );

        let r = reactor.clone();
        let result = reactor.block_on(async move { suspend.wait(&r).await });
        assert!(matches!(result.unwrap(), Err(Error::Timeout)));
        assert!(cleaned.get());
        assert!(reactor.is_idle());
    }

    /// Settling before the deadline cancels the timer.
    #[test]
    fn test_settle_cancels_timer() {
        let reactor = Reactor::new().unwrap();
        let suspend: Suspend<u8> = Suspend::with_timeout(
            |s| s.resume(1),
            Duration::from_secs(60),
            || panic!("timed out"),
        );

        let r = reactor.clone();
        let result = reactor.block_on(async move { suspend.wait(&r).await });
        assert_eq!(result.unwrap().unwrap(), 1);
        assert!(reactor.is_idle());
    }
}
