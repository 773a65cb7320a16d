//! Background listeners: run a callback on a dedicated thread for every
//! match of a subscriber.
//!
//! A listener blocks on an OR subscriber over `[target, stop event]`.
//! Stopping publishes the private stop event, which wakes the thread
//! promptly even while no real match is pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{EventError, EventResult, ExecutionError, ValidationError};
use crate::event::Event;
use crate::predicate::Predicate;
use crate::runtime::CallbackPolicy;
use crate::subscriber::{Combinator, MatchCallback, MatchStream, Subscriber, WaitOutcome};

const TARGET_POSITION: usize = 0;
const STOP_POSITION: usize = 1;

/// Options for `Event::on` and `Subscriber::on`.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Filter for `Event::on`; ignored by `Subscriber::on`.
    pub predicate: Option<Predicate>,
    /// Deliver one match, then stop.
    pub once: bool,
    /// Replay a fact this old when starting.
    pub stale_window: Option<Duration>,
    /// Stop after this long without a match, running timeout callbacks.
    pub timeout: Option<Duration>,
    /// Maximum deliveries per second. Excess matches coalesce to the newest.
    pub max_rate: Option<f64>,
    /// Where the user callback runs.
    pub policy: CallbackPolicy,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            predicate: None,
            once: false,
            stale_window: None,
            timeout: None,
            max_rate: None,
            policy: CallbackPolicy::Inline,
        }
    }
}

impl ListenOptions {
    #[must_use]
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    #[must_use]
    pub fn stale_window(mut self, window: Duration) -> Self {
        self.stale_window = Some(window);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_rate(mut self, per_second: f64) -> Self {
        self.max_rate = Some(per_second);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: CallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn min_interval(&self) -> Result<Option<Duration>, ValidationError> {
        match self.max_rate {
            None => Ok(None),
            Some(rate) if rate.is_finite() && rate > 0.0 => Ok(Some(Duration::from_secs_f64(1.0 / rate))),
            Some(rate) => Err(ValidationError::InvalidMaxRate { value: rate }),
        }
    }
}

struct Shared {
    name: String,
    target: Subscriber,
    owns_target: bool,
    compound: Subscriber,
    stop_event: Event,
    exit: AtomicBool,
    /// Interrupts a rate-limit pause.
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Shared {
    fn request_exit(&self) {
        if self.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.wake_tx.try_send(());
        if let Err(e) = self.stop_event.trigger() {
            tracing::warn!(listener = %self.name, error = %e, "failed to signal listener stop");
        }
    }

    fn teardown(&self) {
        self.compound.stop();
        if self.owns_target {
            self.target.stop();
        }
    }
}

/// Handle to a running listener.
///
/// Dropping the handle asks the thread to stop without waiting for it; call
/// [`Listener::stop`] to wait, or [`Listener::detach`] to leave it running.
#[must_use = "dropping a Listener stops it"]
pub struct Listener {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    detached: bool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Starts listening on `target`.
    ///
    /// When `owns_target` is set the target is expected to be unregistered;
    /// it is registered after the listener so that stale replays reach it,
    /// and it is stopped with the listener.
    pub(crate) fn start(
        dispatcher: &Dispatcher,
        target: Subscriber,
        owns_target: bool,
        callback: MatchCallback,
        options: ListenOptions,
    ) -> EventResult<Self> {
        let min_interval = options.min_interval()?;
        let hex = Uuid::new_v4().simple().to_string();
        let name = format!("listener_{}", &hex[..12]);

        let stop_event = Event::builder(dispatcher).id(format!("{name}_stop")).build()?;
        let compound = Subscriber::builder(dispatcher)
            .name(format!("{name}_{}", target.name()))
            .member(&target)
            .member(&stop_event)
            .combinator(Combinator::Or)
            .stale_window(if owns_target { None } else { options.stale_window })
            .build_detached()?;

        // Coalesce to the newest match while rate limited.
        let stream = compound.stream(usize::from(min_interval.is_some()));
        dispatcher.add_subscriber(&compound)?;
        if owns_target {
            if let Err(e) = dispatcher.add_subscriber(&target) {
                compound.stop();
                return Err(e);
            }
        }

        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(Shared {
            name: name.clone(),
            target,
            owns_target,
            compound,
            stop_event,
            exit: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        });

        let worker = ListenerLoop {
            shared: Arc::clone(&shared),
            stream,
            callback,
            dispatcher: dispatcher.clone(),
            once: options.once,
            timeout: options.timeout,
            min_interval,
            policy: options.policy,
        };
        let handle = thread::Builder::new()
            .name(format!("eventcore-{name}"))
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.teardown();
                EventError::Execution(ExecutionError::SpawnFailed {
                    name: name.clone(),
                    message: e.to_string(),
                })
            })?;

        tracing::debug!(listener = %shared.name, target = %shared.target.name(), "listener started");
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            detached: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The subscriber being listened to.
    #[must_use]
    pub fn target(&self) -> &Subscriber {
        &self.shared.target
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the listener and waits for its thread, unless called from that
    /// thread. Idempotent.
    pub fn stop(&self) {
        self.shared.request_exit();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.shared.teardown();
    }

    /// Lets the listener run for as long as its target lives.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if !self.detached {
            self.shared.request_exit();
        }
    }
}

struct ListenerLoop {
    shared: Arc<Shared>,
    stream: MatchStream,
    callback: MatchCallback,
    dispatcher: Dispatcher,
    once: bool,
    timeout: Option<Duration>,
    min_interval: Option<Duration>,
    policy: CallbackPolicy,
}

/// Tears the listener down when its thread exits, including by panic.
struct TeardownGuard(Arc<Shared>);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.0.teardown();
        tracing::debug!(listener = %self.0.name, "listener exited");
    }
}

impl ListenerLoop {
    fn run(self) {
        let _teardown = TeardownGuard(Arc::clone(&self.shared));
        let mut last_delivery: Option<Instant> = None;
        loop {
            // Pausing before the receive lets the queue coalesce to the newest match.
            if let (Some(min), Some(last)) = (self.min_interval, last_delivery) {
                let elapsed = last.elapsed();
                if elapsed < min {
                    let _ = self.shared.wake_rx.recv_timeout(min - elapsed);
                }
            }
            if self.shared.exit.load(Ordering::Acquire) {
                break;
            }
            let matched = match self.stream.recv_timeout(self.timeout) {
                WaitOutcome::Matched(m) => m,
                WaitOutcome::Aborted => break,
                WaitOutcome::Timeout => {
                    tracing::debug!(listener = %self.shared.name, "listener timed out");
                    self.shared.target.notify_timeout();
                    self.shared.request_exit();
                    break;
                }
            };
            if self.shared.exit.load(Ordering::Acquire) || matched.entry(STOP_POSITION).is_some() {
                break;
            }
            let Some(inner) = matched.entry(TARGET_POSITION).and_then(|e| e.nested()).cloned() else {
                continue;
            };
            last_delivery = Some(Instant::now());

            match self.policy {
                CallbackPolicy::Inline => (self.callback)(&*inner),
                CallbackPolicy::Concurrent => {
                    let callback = Arc::clone(&self.callback);
                    self.dispatcher.submit(Box::new(move || callback(&*inner)));
                }
            }

            if self.once {
                self.shared.request_exit();
                break;
            }
        }
    }
}
