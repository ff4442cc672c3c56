//! Coroutine composition on top of the [`Reactor`].
//!
//! A [`Task`] wraps a future and runs it as a reactor process: it is polled
//! once per step while it can make progress, and detaches itself with
//! [`Reactor::suspend`] while it waits. Nested `async fn` calls compose the
//! way subroutines do: `.await` pushes a frame, its return value (or error,
//! through `?`) pops it back to the caller.
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use futures::future::LocalBoxFuture;

use crate::error::{Error, ReactorError, ReactorResult, Result};
use crate::reactor::{self, Handle, Reactor, DEFAULT_PRIO};

/// Wakes a task by queueing its handle for the reactor's next step.
///
/// Wakers have to be `Send + Sync`, so instead of touching the reactor they
/// only record the handle; the reactor resumes it when it drains the queue.
struct TaskWaker {
    handle: Handle,
    woken: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<Handle>>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        match self.queue.lock() {
            Ok(mut queue) => queue.push(self.handle),
            Err(poisoned) => poisoned.into_inner().push(self.handle),
        }
    }
}

/// Owns the future of one task and polls it from the reactor.
struct Driver {
    reactor: Reactor,
    handle: Handle,
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    woken: Arc<AtomicBool>,
    waker: Waker,
    /// Set when the task is aborted from inside its own poll
    cancelled: Cell<bool>,
}

impl Driver {
    fn poll_once(&self) -> Result<()> {
        self.woken.store(false, Ordering::Release);

        let finished = {
            let mut slot = match self.future.try_borrow_mut() {
                Ok(slot) => slot,
                Err(_) => return Ok(()),
            };
            let Some(future) = slot.as_mut() else {
                return Ok(());
            };
            let mut cx = Context::from_waker(&self.waker);
            let poll = future.as_mut().poll(&mut cx);
            match poll {
                Poll::Ready(()) => slot.take(),
                Poll::Pending if self.cancelled.get() => slot.take(),
                Poll::Pending => None,
            }
        };

        if let Some(future) = finished {
            self.reactor.remove_process(self.handle);
            drop(future);
            return Ok(());
        }

        if self.woken.load(Ordering::Acquire) {
            // Woken while running: stay (or become) active for the next step.
            if self.reactor.is_suspended(self.handle) {
                self.reactor.resume_process(self.handle)?;
            }
        } else if !self.reactor.is_suspended(self.handle) {
            self.reactor.suspend()?;
        }
        Ok(())
    }
}

/// Output slot shared by a task's future and its [`Task`] handle.
struct Completion<T> {
    output: RefCell<Option<T>>,
    done: Cell<bool>,
    waiters: RefCell<Vec<Waker>>,
}

impl<T> Completion<T> {
    fn finish(&self, output: Option<T>) {
        *self.output.borrow_mut() = output;
        self.done.set(true);
        for waker in self.waiters.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

/// Handle to a spawned task.
///
/// Awaiting it yields the task's output, or [`Error::Aborted`] when the task
/// was aborted first. Dropping the handle does not stop the task.
pub struct Task<T> {
    completion: Rc<Completion<T>>,
    driver: Rc<Driver>,
}

impl<T> Task<T> {
    /// True once the task finished or was aborted.
    pub fn is_done(&self) -> bool {
        self.completion.done.get()
    }

    /// The reactor handle the task runs under.
    pub fn handle(&self) -> Handle {
        self.driver.handle
    }

    /// Takes the output of a finished task. `None` while it runs, after an
    /// abort, or when the output was taken before.
    pub fn take_output(&self) -> Option<T> {
        self.completion.output.borrow_mut().take()
    }

    /// Stops the task: its future is dropped (running the destructors of
    /// everything it owned, sockets included) and it leaves the reactor.
    pub fn abort(&self) {
        if self.is_done() {
            return;
        }
        let future = match self.driver.future.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                self.driver.cancelled.set(true);
                None
            }
        };
        self.driver.reactor.remove_process(self.driver.handle);
        drop(future);
        self.completion.finish(None);
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(output) = self.take_output() {
            return Poll::Ready(Ok(output));
        }
        if self.is_done() {
            return Poll::Ready(Err(Error::Aborted));
        }
        self.completion.waiters.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

/// Runs `future` as a process of `reactor` with the default priority.
pub fn spawn<F>(reactor: &Reactor, future: F) -> Task<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    spawn_at(reactor, future, DEFAULT_PRIO)
}

/// Like [`spawn`], with an explicit dispatch priority.
pub fn spawn_with_prio<F>(reactor: &Reactor, future: F, prio: Option<u8>) -> ReactorResult<Task<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let prio = reactor::validate_prio(prio)?;
    Ok(spawn_at(reactor, future, prio))
}

fn spawn_at<F>(reactor: &Reactor, future: F, prio: u8) -> Task<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let completion = Rc::new(Completion {
        output: RefCell::new(None),
        done: Cell::new(false),
        waiters: RefCell::new(Vec::new()),
    });
    let slot = completion.clone();
    let wrapped: LocalBoxFuture<'static, ()> = Box::pin(async move {
        let output = future.await;
        slot.finish(Some(output));
    });

    let handle = reactor.new_process_handle();
    let woken = Arc::new(AtomicBool::new(false));
    let waker = Waker::from(Arc::new(TaskWaker {
        handle,
        woken: woken.clone(),
        queue: reactor.wake_queue(),
    }));
    let driver = Rc::new(Driver {
        reactor: reactor.clone(),
        handle,
        future: RefCell::new(Some(wrapped)),
        woken,
        waker,
        cancelled: Cell::new(false),
    });

    let runner = driver.clone();
    reactor.attach_process(handle, move || runner.poll_once(), prio);
    Task { completion, driver }
}

impl Reactor {
    /// Drives the reactor until `future` completes and returns its output.
    ///
    /// # Errors
    /// - `ReactorError::Idle` when the future waits on something the reactor
    ///   can never deliver (nothing left registered)
    /// - `ReactorError::Polling` when the OS poller fails
    /// - `Error::Aborted` when the task was aborted from inside
    ///
    /// Callback errors from other registrations are logged, not returned.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let task = spawn(self, future);
        loop {
            if let Some(output) = task.take_output() {
                return Ok(output);
            }
            if task.is_done() {
                return Err(Error::Aborted);
            }
            if self.is_idle() {
                task.abort();
                return Err(ReactorError::Idle.into());
            }
            match self.step() {
                Ok(()) => {}
                Err(Error::Reactor(err @ ReactorError::Polling(_))) => return Err(err.into()),
                Err(err) => log::error!("Reactor callback failed: {}", err),
            }
        }
    }
}

/// Cedes the rest of this turn; the task continues on the next step.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Passes plain values from a task to an observer without ending it.
pub struct Emitter<Y> {
    sink: Rc<RefCell<dyn FnMut(Y)>>,
}

impl<Y> Clone for Emitter<Y> {
    fn clone(&self) -> Self {
        Emitter { sink: self.sink.clone() }
    }
}

impl<Y> Emitter<Y> {
    pub fn emit(&self, item: Y) {
        (&mut *self.sink.borrow_mut())(item);
    }
}

/// Spawns `body` with an [`Emitter`] feeding `sink`.
pub fn compose<Y, F, Fut>(reactor: &Reactor, sink: impl FnMut(Y) + 'static, body: F) -> Task<Fut::Output>
where
    Y: 'static,
    F: FnOnce(Emitter<Y>) -> Fut,
    Fut: Future + 'static,
    Fut::Output: 'static,
{
    let emitter = Emitter {
        sink: Rc::new(RefCell::new(sink)),
    };
    spawn(reactor, body(emitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramingError;
    use std::time::Duration;

    async fn leaf(value: u32) -> Result<u32> {
        yield_now().await;
        Ok(value * 2)
    }

    async fn middle(value: u32) -> Result<u32> {
        let doubled = leaf(value).await?;
        Ok(doubled + 1)
    }

    async fn failing() -> Result<u32> {
        middle(1).await?;
        Err(FramingError::PrematureClose.into())
    }

    /// Tests that block_on drives a plain future to completion.
    #[test]
    fn test_block_on() {
        let reactor = Reactor::new().unwrap();
        let result = reactor.block_on(async { "completed" });
        assert_eq!(result.unwrap(), "completed");
        assert!(reactor.is_idle());
    }

    /// Return values and errors travel up through nested frames.
    #[test]
    fn test_nested_frames() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(reactor.block_on(middle(20)).unwrap().unwrap(), 41);

        let err = reactor.block_on(failing()).unwrap().unwrap_err();
        assert!(matches!(err, Error::Framing(FramingError::PrematureClose)));
    }

    /// yield_now hands the turn to other tasks of the same step.
    #[test]
    fn test_yield_interleaves_tasks() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        let a = spawn(&reactor, async move {
            l.borrow_mut().push("a1");
            yield_now().await;
            l.borrow_mut().push("a2");
        });
        let l = log.clone();
        let b = spawn(&reactor, async move {
            l.borrow_mut().push("b1");
            yield_now().await;
            l.borrow_mut().push("b2");
        });

        while !(a.is_done() && b.is_done()) {
            reactor.step().unwrap();
        }
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
    }

    /// A waiting task is detached from the reactor and resumed by its waker.
    #[test]
    fn test_waiting_task_is_suspended() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let task = spawn(&reactor, async move {
            r.sleep(Duration::from_millis(5)).await;
            7
        });

        reactor.step().unwrap();
        assert!(reactor.is_suspended(task.handle()));

        while !task.is_done() {
            reactor.step().unwrap();
        }
        assert_eq!(task.take_output(), Some(7));
        assert!(reactor.is_idle());
    }

    #[test]
    fn test_await_other_task() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let inner = spawn(&reactor, async move {
            r.sleep(Duration::from_millis(1)).await;
            "inner"
        });
        let outer = reactor.block_on(async move { inner.await });
        assert_eq!(outer.unwrap().unwrap(), "inner");
    }

    /// Aborting drops the future, which withdraws its pending registrations.
    #[test]
    fn test_abort() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        let task = spawn(&reactor, async move {
            r.sleep(Duration::from_secs(60)).await;
            1
        });
        reactor.step().unwrap();
        assert!(!reactor.is_idle());

        task.abort();
        assert!(task.is_done());
        assert_eq!(task.take_output(), None);
        assert!(reactor.is_idle());

        let waiting = reactor.block_on(async move { task.await });
        assert!(matches!(waiting.unwrap(), Err(Error::Aborted)));
    }

    /// Waiting on something the reactor can never deliver ends with Idle.
    #[test]
    fn test_block_on_idle() {
        let reactor = Reactor::new().unwrap();
        let result = reactor.block_on(futures::future::pending::<()>());
        assert!(matches!(result, Err(Error::Reactor(ReactorError::Idle))));
    }

    #[test]
    fn test_spawn_with_invalid_prio() {
        let reactor = Reactor::new().unwrap();
        assert!(spawn_with_prio(&reactor, async {}, Some(10)).is_err());
        assert!(spawn_with_prio(&reactor, async {}, Some(9)).is_ok());
    }

    #[test]
    fn test_emitter_passes_values() {
        let reactor = Reactor::new().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        let task = compose(&reactor, move |item: &'static str| s.borrow_mut().push(item), |emit| async move {
            emit.emit("first");
            yield_now().await;
            emit.emit("second");
            "done"
        });

        while !task.is_done() {
            reactor.step().unwrap();
        }
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
        assert_eq!(task.take_output(), Some("done"));
    }
}
