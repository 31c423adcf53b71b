use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};
use std::thread::{self, Thread};

use futures::future::LocalBoxFuture;
use futures::task::{ArcWake, waker_ref};
use pin_project_lite::pin_project;

use crate::{AsyncError, Deferred};

pub(crate) type TaskId = u64;

/// Ids of tasks that were woken, shared with wakers on any thread.
///
/// Waking pushes the id and unparks the loop thread, so a loop blocked in
/// `park`/`park_timeout` notices work completed by a worker.
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    thread: Thread,
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyQueue").field("len", &self.len()).finish()
    }
}

impl ReadyQueue {
    pub(crate) fn for_current_thread() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), thread: thread::current() }
    }

    pub(crate) fn push(&self, id: TaskId) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(id);
        self.thread.unpark();
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) struct TaskWaker {
    id: TaskId,
    queued: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.ready.push(arc_self.id);
        }
    }
}

/// A spawned unit of work owned by the loop.
///
/// The future is taken out of its slot while being polled so that the task
/// can spawn or cancel other tasks (including itself) from inside `poll`.
pub(crate) struct Task {
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    waker: Arc<TaskWaker>,
    cancelled: Cell<bool>,
}

impl Task {
    pub(crate) fn new(id: TaskId, future: LocalBoxFuture<'static, ()>, ready: Arc<ReadyQueue>) -> Self {
        Self {
            future: RefCell::new(Some(future)),
            waker: Arc::new(TaskWaker { id, queued: AtomicBool::new(false), ready }),
            cancelled: Cell::new(false),
        }
    }

    pub(crate) fn schedule(&self) {
        ArcWake::wake_by_ref(&self.waker);
    }

    /// Polls the task once. Returns `true` when the task is finished, either
    /// because the future completed or because it was cancelled meanwhile.
    pub(crate) fn poll(&self) -> bool {
        self.waker.queued.store(false, Ordering::Release);

        let Some(mut future) = self.future.borrow_mut().take() else {
            return true;
        };

        let waker = waker_ref(&self.waker);
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => true,
            Poll::Pending if self.cancelled.get() => true,
            Poll::Pending => {
                *self.future.borrow_mut() = Some(future);
                false
            }
        }
    }

    /// Marks the task cancelled and drops its future unless it is being polled
    /// right now, in which case `poll` drops it on return.
    pub(crate) fn cancel(&self) {
        self.cancelled.set(true);
        let future = self.future.borrow_mut().take();
        drop(future);
    }
}

pin_project! {
    /// Drives a fallible future and settles a deferred with its output.
    pub(crate) struct SettleOnCompletion<F, T> {
        #[pin]
        future: F,
        deferred: Deferred<T>,
    }
}

impl<F, T> SettleOnCompletion<F, T> {
    pub(crate) fn new(future: F, deferred: Deferred<T>) -> Self {
        Self { future, deferred }
    }
}

impl<F, T> Future for SettleOnCompletion<F, T>
where
    F: Future<Output = Result<T, AsyncError>>,
    T: Clone + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = ready!(this.future.poll(cx));
        this.deferred.complete(outcome);
        Poll::Ready(())
    }
}
