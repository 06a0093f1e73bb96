//! Worker registry and completion delivery.
//!
//! The [`Registry`] owns a multi-threaded tokio runtime that executes driver
//! phases, and a completion channel that carries finished batons back to
//! where continuations run:
//! - [`DeliveryMode::Dedicated`]: one background thread delivers, so
//!   continuations never run concurrently.
//! - [`DeliveryMode::Polled`]: the caller drains completions with
//!   [`Registry::run_pending`] or [`Registry::wait_pending`].
//!
//! Every submitted task delivers exactly one result to exactly one
//! continuation. A panic inside the driver phase becomes a failure result.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use docbridge_common::{BridgeError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, warn};

use crate::baton::{Baton, Continuation};
use crate::config::{BridgeConfig, DeliveryMode};
use crate::operation::{self, failure_value, OpKind};
use crate::server::ConnectionState;

/// How long shutdown waits for in-flight tasks
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Result of a driver phase
pub(crate) enum Outcome {
    Done(Baton),
    Panicked(String),
}

impl Outcome {
    pub(crate) fn shape(&self) -> (bool, JsonValue) {
        match self {
            Outcome::Done(baton) => operation::shape(baton),
            Outcome::Panicked(message) => (true, failure_value(message, -1)),
        }
    }
}

struct Completion {
    kind: OpKind,
    outcome: Outcome,
    continuation: Continuation,
}

enum DeliveryCommand {
    Deliver(Completion),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicU64,
    connections: AtomicU64,
    batons_released: AtomicU64,
    documents_released: AtomicU64,
}

/// Holds an in-flight slot for the duration of a synchronous driver phase
struct Admission<'a>(&'a Counters);

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub connections_created: u64,
    pub batons_released: u64,
    pub documents_released: u64,
}

struct Inner {
    config: BridgeConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    sender: Sender<DeliveryCommand>,
    receiver: Receiver<DeliveryCommand>,
    delivery_thread: Mutex<Option<JoinHandle<()>>>,
    delivery_thread_id: Option<ThreadId>,
    running: AtomicBool,
    counters: Arc<Counters>,
}

/// Process-wide worker pool and delivery context.
///
/// Cloning yields another handle to the same registry. It shuts down on
/// [`Registry::shutdown`] or when the last handle is dropped.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn start(config: BridgeConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.workers.max(1))
            .thread_name("docbridge-worker")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::Runtime(format!("Failed to start worker runtime: {}", e)))?;
        let handle = runtime.handle().clone();

        let (sender, receiver) = unbounded::<DeliveryCommand>();
        let counters = Arc::new(Counters::default());

        let delivery_thread = match config.delivery {
            DeliveryMode::Dedicated => {
                let thread_receiver = receiver.clone();
                let thread_counters = Arc::clone(&counters);
                let thread = thread::Builder::new()
                    .name("docbridge-delivery".to_string())
                    .spawn(move || Self::delivery_loop(thread_receiver, thread_counters))
                    .map_err(|e| BridgeError::Runtime(format!("Failed to start delivery thread: {}", e)))?;
                Some(thread)
            }
            DeliveryMode::Polled => None,
        };
        let delivery_thread_id = delivery_thread.as_ref().map(|t| t.thread().id());

        info!(workers = config.workers, delivery = ?config.delivery, "Registry started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                runtime: Mutex::new(Some(runtime)),
                handle,
                sender,
                receiver,
                delivery_thread: Mutex::new(delivery_thread),
                delivery_thread_id,
                running: AtomicBool::new(true),
                counters,
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RegistryStats {
        let counters = &self.inner.counters;
        RegistryStats {
            tasks_submitted: counters.submitted.load(Ordering::SeqCst),
            tasks_completed: counters.completed.load(Ordering::SeqCst),
            connections_created: counters.connections.load(Ordering::SeqCst),
            batons_released: counters.batons_released.load(Ordering::SeqCst),
            documents_released: counters.documents_released.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, wait for in-flight tasks and deliver their
    /// results, then stop the workers. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Deliver every completion already queued, on the calling thread.
    /// Returns the number delivered. Does nothing in dedicated mode.
    pub fn run_pending(&self) -> usize {
        if self.inner.config.delivery != DeliveryMode::Polled {
            return 0;
        }
        let mut delivered = 0;
        while let Ok(command) = self.inner.receiver.try_recv() {
            if let DeliveryCommand::Deliver(completion) = command {
                deliver(completion, &self.inner.counters);
                delivered += 1;
            }
        }
        delivered
    }

    /// Block until at least one completion arrives or `timeout` passes, then
    /// deliver everything queued. Returns the number delivered.
    pub fn wait_pending(&self, timeout: Duration) -> usize {
        if self.inner.config.delivery != DeliveryMode::Polled {
            return 0;
        }
        match self.inner.receiver.recv_timeout(timeout) {
            Ok(DeliveryCommand::Deliver(completion)) => {
                deliver(completion, &self.inner.counters);
                1 + self.run_pending()
            }
            Ok(DeliveryCommand::Shutdown) | Err(RecvTimeoutError::Timeout) => self.run_pending(),
            Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Wait until every submitted task has been delivered
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stats = self.stats();
            if stats.tasks_completed >= stats.tasks_submitted {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if self.inner.config.delivery == DeliveryMode::Polled {
                self.wait_pending(Duration::from_millis(10));
            } else {
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    pub(crate) fn connection_created(&self) {
        self.inner.counters.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BridgeError::Runtime("Registry is not running".to_string()))
        }
    }

    /// Take an in-flight slot, or fail if shutdown has begun.
    ///
    /// The slot is taken before `running` is read, so a concurrent shutdown
    /// either rejects this call or waits for it.
    fn admit(&self) -> Result<()> {
        let counters = &self.inner.counters;
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            Err(BridgeError::Runtime("Registry is not running".to_string()))
        }
    }

    /// Run the driver phase on the calling thread
    pub(crate) fn run_sync(&self, baton: Baton, connection: &Arc<ConnectionState>) -> Result<Outcome> {
        if !baton.kind().uses_driver() {
            self.ensure_running()?;
            return Ok(Outcome::Done(baton));
        }
        if Handle::try_current().is_ok() {
            return Err(BridgeError::Runtime(
                "Synchronous call made from inside an async runtime".to_string(),
            ));
        }
        self.admit()?;
        let _slot = Admission(&self.inner.counters);
        let phase = AssertUnwindSafe(driver_phase(baton, Arc::clone(connection))).catch_unwind();
        Ok(match self.inner.handle.block_on(phase) {
            Ok(baton) => Outcome::Done(baton),
            Err(payload) => Outcome::Panicked(panic_message(payload)),
        })
    }

    /// Release a finished synchronous call's baton
    pub(crate) fn retire(&self, outcome: Outcome) {
        retire(outcome, &self.inner.counters);
    }

    /// Hand a baton to the worker pool; its continuation runs on delivery
    pub(crate) fn submit(&self, mut baton: Baton, connection: Arc<ConnectionState>) -> Result<()> {
        let continuation = baton.continuation.take().ok_or(BridgeError::Unprocessable)?;
        let kind = baton.kind();

        self.admit()?;
        let counters = Arc::clone(&self.inner.counters);
        counters.submitted.fetch_add(1, Ordering::SeqCst);

        let sender = self.inner.sender.clone();
        self.inner.handle.spawn(async move {
            let outcome = match AssertUnwindSafe(driver_phase(baton, connection)).catch_unwind().await {
                Ok(baton) => Outcome::Done(baton),
                Err(payload) => {
                    let message = panic_message(payload);
                    error!(op = kind.name(), %message, "Driver phase panicked");
                    Outcome::Panicked(message)
                }
            };
            let completion = Completion {
                kind,
                outcome,
                continuation,
            };
            if sender.send(DeliveryCommand::Deliver(completion)).is_err() {
                error!(op = kind.name(), "Completion channel closed; result dropped");
            }
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn delivery_loop(receiver: Receiver<DeliveryCommand>, counters: Arc<Counters>) {
        debug!("Delivery thread started");
        loop {
            match receiver.recv() {
                Ok(DeliveryCommand::Deliver(completion)) => deliver(completion, &counters),
                Ok(DeliveryCommand::Shutdown) => {
                    debug!("Delivery thread received shutdown");
                    break;
                }
                Err(_) => break,
            }
        }
    }
}

impl Inner {
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Registry shutting down");

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.counters.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.counters.in_flight.load(Ordering::SeqCst),
                    "Shutdown grace period elapsed with tasks still running"
                );
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        match self.config.delivery {
            DeliveryMode::Dedicated => {
                // Queued after every completion, so those are delivered first
                let _ = self.sender.send(DeliveryCommand::Shutdown);
                let on_delivery_thread = self.delivery_thread_id == Some(thread::current().id());
                if let Some(handle) = self.delivery_thread.lock().take() {
                    if !on_delivery_thread && handle.join().is_err() {
                        error!("Delivery thread panicked");
                    }
                }
            }
            DeliveryMode::Polled => {
                while let Ok(command) = self.receiver.try_recv() {
                    if let DeliveryCommand::Deliver(completion) = command {
                        deliver(completion, &self.counters);
                    }
                }
            }
        }

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("Registry stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the continuation, then release the baton
fn deliver(completion: Completion, counters: &Counters) {
    let Completion {
        kind,
        outcome,
        continuation,
    } = completion;
    let (error, value) = outcome.shape();
    if std::panic::catch_unwind(AssertUnwindSafe(|| continuation(error, value))).is_err() {
        error!(op = kind.name(), "Continuation panicked");
    }
    retire(outcome, counters);
    counters.completed.fetch_add(1, Ordering::SeqCst);
}

/// Release the baton's arena and count it
fn retire(outcome: Outcome, counters: &Counters) {
    if let Outcome::Done(mut baton) = outcome {
        let released = baton.release();
        counters.batons_released.fetch_add(1, Ordering::SeqCst);
        counters.documents_released.fetch_add(released as u64, Ordering::SeqCst);
    }
}

/// The only phase that touches the driver. Holds the connection's lock for
/// the duration of the call.
async fn driver_phase(mut baton: Baton, connection: Arc<ConnectionState>) -> Baton {
    if !baton.kind().uses_driver() {
        return baton;
    }
    let mut driver = connection.driver.lock().await;
    operation::execute(&mut baton, &mut **driver).await;
    drop(driver);

    if baton.error().is_none() {
        match baton.kind() {
            OpKind::Open => connection.mark_open(baton.target.clone()),
            OpKind::Close => connection.mark_closed(),
            _ => {}
        }
    }
    baton
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("Operation panicked: {}", detail)
}
