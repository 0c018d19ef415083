//! Policy on when asynchronous calls run.
//!
//! The dispatcher owns three queues: calls waiting to run, calls
//! currently running, and synchronous calls registered for cancellation
//! and counting. A call runs when the total running count is under
//! `max_requests` and its host's running count is under
//! `max_requests_per_host`; otherwise it waits in `ready` until a
//! finishing call or a raised limit promotes it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{trace, warn};

use crate::client::{AsyncCall, CallState};

/// Schedules concurrent call execution under global and per-host caps.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    executor: Executor,
    next_id: AtomicU64,
}

struct State {
    max_requests: usize,
    max_requests_per_host: usize,
    ready: VecDeque<QueuedCall>,
    running: Vec<CallHandle>,
    executed_sync: Vec<CallHandle>,
}

struct QueuedCall {
    call: AsyncCall,
    handle: CallHandle,
}

#[derive(Clone)]
struct CallHandle {
    id: u64,
    host: String,
    tag: Option<String>,
    state: Arc<CallState>,
}

impl Dispatcher {
    /// A dispatcher with the default limits: 64 concurrent calls, 5 per
    /// host.
    pub fn new() -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    max_requests: 64,
                    max_requests_per_host: 5,
                    ready: VecDeque::new(),
                    running: Vec::new(),
                    executed_sync: Vec::new(),
                }),
                executor: Executor::new(Duration::from_secs(60)),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Caps the calls executing concurrently overall. Queued calls above
    /// the new cap start as running ones finish; in-flight calls are not
    /// preempted.
    ///
    /// # Panics
    ///
    /// Panics unless `max >= 1`.
    pub fn set_max_requests(&self, max: usize) {
        assert!(max >= 1, "max < 1: {}", max);
        let mut state = self.inner.state.lock().unwrap();
        state.max_requests = max;
        self.promote_calls(&mut state);
    }

    /// Caps the calls executing concurrently per host. The count keys on
    /// the URL host name only, so several hosts sharing an IP may
    /// together exceed the cap at the address level.
    ///
    /// # Panics
    ///
    /// Panics unless `max >= 1`.
    pub fn set_max_requests_per_host(&self, max: usize) {
        assert!(max >= 1, "max < 1: {}", max);
        let mut state = self.inner.state.lock().unwrap();
        state.max_requests_per_host = max;
        self.promote_calls(&mut state);
    }

    /// The global concurrency cap.
    pub fn max_requests(&self) -> usize {
        self.inner.state.lock().unwrap().max_requests
    }

    /// The per-host concurrency cap.
    pub fn max_requests_per_host(&self) -> usize {
        self.inner.state.lock().unwrap().max_requests_per_host
    }

    /// Calls currently executing, asynchronous and synchronous.
    pub fn running_call_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.running.len() + state.executed_sync.len()
    }

    /// Asynchronous calls waiting for a slot.
    pub fn queued_call_count(&self) -> usize {
        self.inner.state.lock().unwrap().ready.len()
    }

    /// Cancels every known call whose request carries `tag`. Running
    /// calls also get their sockets shut down to interrupt blocked IO.
    pub fn cancel(&self, tag: &str) {
        let state = self.inner.state.lock().unwrap();
        for queued in &state.ready {
            if queued.handle.tag.as_deref() == Some(tag) {
                queued.handle.state.cancel();
            }
        }
        for handle in state.running.iter().chain(state.executed_sync.iter()) {
            if handle.tag.as_deref() == Some(tag) {
                handle.state.cancel();
            }
        }
    }

    /// Queues `call`, running it immediately when capacity allows.
    pub(crate) fn enqueue(&self, call: AsyncCall) {
        let handle = self.handle_for(&call);
        let mut state = self.inner.state.lock().unwrap();
        if state.running.len() < state.max_requests
            && state.running_for_host(&handle.host) < state.max_requests_per_host
        {
            state.running.push(handle.clone());
            self.submit(call, handle);
        } else {
            trace!("queueing call for {}", handle.host);
            state.ready.push_back(QueuedCall { call, handle });
        }
    }

    /// Registers a synchronous call for counting and cancellation.
    pub(crate) fn executed(&self, state: &Arc<CallState>, host: &str, tag: Option<&str>) -> u64 {
        let handle = CallHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            host: host.to_owned(),
            tag: tag.map(str::to_owned),
            state: Arc::clone(state),
        };
        let id = handle.id;
        self.inner.state.lock().unwrap().executed_sync.push(handle);
        id
    }

    /// Unregisters a finished synchronous call.
    pub(crate) fn finished_sync(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.executed_sync.retain(|handle| handle.id != id);
    }

    /// Unregisters a finished asynchronous call and promotes queued ones.
    fn finished(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.running.retain(|handle| handle.id != id);
        self.promote_calls(&mut state);
    }

    /// Moves ready calls into running, in order, while capacity remains.
    fn promote_calls(&self, state: &mut State) {
        if state.running.len() >= state.max_requests {
            return;
        }
        let mut i = 0;
        while i < state.ready.len() && state.running.len() < state.max_requests {
            let host_ok = {
                let queued = &state.ready[i];
                state.running_for_host(&queued.handle.host) < state.max_requests_per_host
            };
            if !host_ok {
                i += 1;
                continue;
            }
            let queued = state.ready.remove(i).expect("index checked above");
            state.running.push(queued.handle.clone());
            self.submit(queued.call, queued.handle);
        }
    }

    fn submit(&self, call: AsyncCall, handle: CallHandle) {
        trace!("submitting call for {}", handle.host);
        let dispatcher = self.clone();
        let id = handle.id;
        self.inner.executor.execute(Box::new(move || {
            // The guard unregisters the call even if the callback panics.
            let _guard = FinishGuard { dispatcher, id };
            let AsyncCall { call, callback } = call;
            let result = call.execute_inner();
            callback(result);
        }));
    }

    fn handle_for(&self, call: &AsyncCall) -> CallHandle {
        CallHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            host: call.call.request().host().to_owned(),
            tag: call.call.request().tag().map(str::to_owned),
            state: call.call.state(),
        }
    }
}

impl State {
    fn running_for_host(&self, host: &str) -> usize {
        self.running
            .iter()
            .filter(|handle| handle.host == host)
            .count()
    }
}

struct FinishGuard {
    dispatcher: Dispatcher,
    id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.dispatcher.finished(self.id);
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("running", &state.running.len())
            .field("ready", &state.ready.len())
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A cached thread executor: spawns on demand, reuses workers that
/// finished a job, lets idle workers expire after the keep-alive.
struct Executor {
    idle: Arc<Mutex<Vec<mpsc::Sender<Job>>>>,
    keep_alive: Duration,
}

impl Executor {
    fn new(keep_alive: Duration) -> Executor {
        Executor {
            idle: Arc::new(Mutex::new(Vec::new())),
            keep_alive,
        }
    }

    fn execute(&self, job: Job) {
        let mut job = job;
        loop {
            let sender = self.idle.lock().unwrap().pop();
            match sender {
                Some(sender) => match sender.send(job) {
                    Ok(()) => return,
                    // The worker expired; reclaim the job and try again.
                    Err(mpsc::SendError(reclaimed)) => job = reclaimed,
                },
                None => {
                    self.spawn(job);
                    return;
                }
            }
        }
    }

    fn spawn(&self, job: Job) {
        let (sender, receiver) = mpsc::channel::<Job>();
        let idle = Arc::clone(&self.idle);
        let keep_alive = self.keep_alive;
        let spawned = thread::Builder::new()
            .name("carrier-dispatcher".to_owned())
            .spawn(move || {
                let mut job = Some(job);
                loop {
                    if let Some(job) = job.take() {
                        job();
                    }
                    // Offer this worker for reuse, then wait for the next
                    // job or expire.
                    idle.lock().unwrap().push(sender.clone());
                    match receiver.recv_timeout(keep_alive) {
                        Ok(next) => job = Some(next),
                        Err(_) => return,
                    }
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn dispatcher thread: {}", err);
        }
    }
}
