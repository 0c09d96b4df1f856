//! Native-state resolution
//!
//! A managed method's entry pointer may sit behind a precode, and that
//! precode behind a tiered-compilation counting stub, for an unbounded time
//! after compilation is requested. One shared watcher thread polls every
//! in-flight method round-robin until each reaches stable native code,
//! amortizing the detection cost instead of spinning one thread per method.
//! `resolve` blocks the caller until the watcher reports completion or the
//! configured timeout elapses; the timeout is fatal, a runtime whose thunks
//! we cannot recognize is not supported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use latch_common::{Error, MethodDescriptor, MethodId, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::precode::{CountingStub, FixupPrecode};

/// Per-method resolution record, cached for the environment's lifetime.
pub struct NativeState {
    method: Arc<dyn MethodDescriptor>,
    native_code: AtomicUsize,
    resolved: AtomicBool,
}

impl std::fmt::Debug for NativeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeState")
            .field("method", &self.method.id())
            .field("native_code", &self.native_code)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl NativeState {
    fn new(method: Arc<dyn MethodDescriptor>) -> Self {
        Self {
            method,
            native_code: AtomicUsize::new(0),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn method(&self) -> &Arc<dyn MethodDescriptor> {
        &self.method
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Stable native entry, once resolution completed.
    pub fn native_code(&self) -> Option<usize> {
        if self.is_resolved() {
            Some(self.native_code.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn finish(&self, native: usize) {
        self.native_code.store(native, Ordering::Release);
        self.resolved.store(true, Ordering::Release);
    }
}

struct WatcherShared {
    queue: Mutex<Vec<Arc<NativeState>>>,
    shutdown: AtomicBool,
}

/// Shared polling thread driving all in-flight resolutions.
pub struct JitWatcher {
    shared: Arc<WatcherShared>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl JitWatcher {
    pub fn start(poll_interval: Duration) -> Self {
        let shared = Arc::new(WatcherShared {
            queue: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("latch-jit-watcher".into())
            .spawn(move || watcher_body(thread_shared, poll_interval))
            .expect("failed to spawn watcher thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn enqueue(&self, state: Arc<NativeState>) {
        let mut queue = self.shared.queue.lock();
        if !queue.iter().any(|s| Arc::ptr_eq(s, &state)) {
            queue.push(state);
        }
    }

    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn watcher_body(shared: Arc<WatcherShared>, poll_interval: Duration) {
    debug!(target: "latch_core::resolver", "watcher thread running");
    while !shared.shutdown.load(Ordering::Acquire) {
        let pending: Vec<Arc<NativeState>> = shared.queue.lock().clone();
        if pending.is_empty() {
            std::thread::sleep(poll_interval);
            continue;
        }

        for state in &pending {
            if poll_method(state) {
                shared.queue.lock().retain(|s| !Arc::ptr_eq(s, state));
            }
        }
        std::thread::sleep(poll_interval);
    }
    debug!(target: "latch_core::resolver", "watcher thread stopped");
}

/// One polling step for one method. Returns true when resolution finished.
fn poll_method(state: &NativeState) -> bool {
    let pointer = state.method.entry_pointer();
    if pointer == 0 {
        return false;
    }

    let Some(precode) = FixupPrecode::detect(pointer) else {
        // No thunk in front: the entry already is the native code.
        state.finish(pointer);
        return true;
    };

    if precode.is_unresolved() {
        return false;
    }

    let target = precode.target();
    let Some(stub) = CountingStub::detect(target) else {
        state.finish(target);
        debug!(
            target: "latch_core::resolver",
            method = state.method.name(),
            native = format_args!("{target:#x}"),
            "resolved native code"
        );
        return true;
    };

    let body = stub.body_target();
    if let Err(e) = stub.neutralize() {
        // The body address is still usable; the method just keeps paying
        // the counter check.
        warn!(
            target: "latch_core::resolver",
            method = state.method.name(),
            "failed to neutralize counting stub: {e}"
        );
    } else {
        debug!(
            target: "latch_core::resolver",
            method = state.method.name(),
            "disabled tiered compilation counter"
        );
    }
    state.finish(body);
    true
}

/// Resolution front end: cache plus blocking wait.
pub struct Resolver {
    cache: Mutex<HashMap<MethodId, Arc<NativeState>>>,
    watcher: JitWatcher,
    timeout: Duration,
}

impl Resolver {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            watcher: JitWatcher::start(poll_interval),
            timeout,
        }
    }

    /// Blocks until `method` has stable native code. Idempotent per method
    /// identity: repeated calls share one record.
    pub fn resolve(&self, method: Arc<dyn MethodDescriptor>) -> Result<Arc<NativeState>> {
        if method.entry_pointer() == 0 {
            return Err(Error::InvalidTarget(format!(
                "method '{}' has no entry pointer",
                method.name()
            )));
        }

        let state = {
            let mut cache = self.cache.lock();
            Arc::clone(
                cache
                    .entry(method.id())
                    .or_insert_with(|| Arc::new(NativeState::new(Arc::clone(&method)))),
            )
        };

        if state.is_resolved() {
            return Ok(state);
        }

        method.request_compilation();
        self.watcher.enqueue(Arc::clone(&state));

        let started = Instant::now();
        while !state.is_resolved() {
            if started.elapsed() > self.timeout {
                return Err(Error::CompilationTimeout {
                    method: method.name().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(state)
    }

    pub fn shutdown(&self) {
        self.watcher.stop();
    }
}
