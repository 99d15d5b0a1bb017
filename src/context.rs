//! Per-service state: handle, mailbox, module, instance, and bookkeeping counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::ServiceApi;
use crate::handle::Handle;
use crate::mailbox::Mailbox;
use crate::message::{MessageType, Session, SESSION_MASK};
use crate::module::{Instance, Module};

/// Signature for a service's message callback, installed by a module (typically from its own
/// `init`, via [`crate::api::ServiceApi::set_callback`]) and invoked by the dispatcher for
/// every message the service's mailbox yields. Arguments mirror spec §4.4's callback contract
/// `f(type, session, source, payload, size) -> bool`; the leading `&dyn ServiceApi` is how the
/// callback sends replies or looks up other services without capturing runtime internals.
/// Returning `true` means "consumed"; `false` asks the dispatcher to send an automatic
/// [`MessageType::Error`] reply when the message carried a non-zero session.
pub type Callback =
    dyn FnMut(&dyn ServiceApi, MessageType, Session, Handle, Option<&[u8]>) -> bool + Send;

/// Everything the runtime needs to dispatch messages to one service instance.
///
/// Held behind an `Arc` shared between the [`crate::handle::Registry`] slot table and
/// whichever worker currently has the owning mailbox detached for dispatch. `refcount`
/// exists independently of the `Arc`'s own strong count: it tracks *logical* holders (the
/// registry slot, plus any in-flight `grab`) so `release()`'s "last holder" observation
/// matches skynet's handle refcounting rather than Rust's drop order.
pub struct ServiceContext {
    handle: Mutex<Handle>,
    mailbox: Arc<Mailbox>,
    module: Arc<dyn Module>,
    instance: Mutex<Instance>,
    next_session: AtomicU32,
    callback: Mutex<Option<Box<Callback>>>,
    cpu_ns: AtomicU64,
    refcount: AtomicU32,
}

impl ServiceContext {
    /// Builds a context before it has a handle. The caller must follow up with
    /// [`Registry::register`](crate::handle::Registry::register) and [`Self::set_handle`].
    pub fn new_unregistered(module: Arc<dyn Module>, mailbox: Arc<Mailbox>) -> Arc<Self> {
        let instance = module.create();
        Arc::new(ServiceContext {
            handle: Mutex::new(Handle::SYSTEM),
            mailbox,
            module,
            instance: Mutex::new(instance),
            next_session: AtomicU32::new(1),
            callback: Mutex::new(None),
            cpu_ns: AtomicU64::new(0),
            refcount: AtomicU32::new(1),
        })
    }

    /// Records the handle assigned by the registry. Called once, immediately after
    /// `Registry::register` returns.
    pub fn set_handle(&self, handle: Handle) {
        *self.handle.lock() = handle;
    }

    pub fn handle(&self) -> Handle {
        *self.handle.lock()
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// Runs `f` against the module's type-erased instance state. Only ever called by the
    /// one worker currently dispatching this service's mailbox, so no locking beyond the
    /// `Mutex` needed to satisfy `Sync` is required.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut Instance) -> R) -> R {
        let mut guard = self.instance.lock();
        f(&mut guard)
    }

    /// Allocates the next session id for an outgoing request, skipping `0` and wrapping
    /// within the 24-bit session space (spec §4.4).
    pub fn alloc_session(&self) -> Session {
        loop {
            let prev = self.next_session.fetch_add(1, Ordering::Relaxed);
            let session = prev & SESSION_MASK;
            if session != 0 {
                return session;
            }
            // landed on the reserved 0; the fetch_add above already advanced past it for
            // the next caller, just retry for this one
        }
    }

    pub fn set_callback(&self, cb: Box<Callback>) {
        *self.callback.lock() = Some(cb);
    }

    pub fn take_callback(&self) -> Option<Box<Callback>> {
        self.callback.lock().take()
    }

    pub fn put_callback_back(&self, cb: Box<Callback>) {
        *self.callback.lock() = Some(cb);
    }

    pub fn add_cpu_ns(&self, ns: u64) {
        self.cpu_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn cpu_ns(&self) -> u64 {
        self.cpu_ns.load(Ordering::Relaxed)
    }

    /// Increments the logical refcount. Paired with [`Self::release`].
    pub fn grab(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the logical refcount; on reaching zero, runs the module's `release` hook.
    ///
    /// Called once by `Registry::retire` (for the slot's own reference) and once per
    /// matching `Registry::grab`. Keeping this outside the registry's write lock means a
    /// `release` that runs the module's teardown code never blocks unrelated registry
    /// operations.
    pub fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let handle = self.handle();
            self.module.release(&mut self.instance.lock(), handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::DemoEchoModule;

    #[test]
    fn session_allocation_skips_zero_and_wraps() {
        let module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox);
        ctx.next_session.store(SESSION_MASK, Ordering::Relaxed);
        let a = ctx.alloc_session();
        assert_eq!(a, SESSION_MASK);
        let b = ctx.alloc_session();
        assert_ne!(b, 0, "session allocation must never hand out 0");
    }

    #[test]
    fn release_runs_module_teardown_once_refcount_hits_zero() {
        let module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox);
        ctx.grab();
        ctx.release();
        // still one ref outstanding (the initial refcount=1 from new_unregistered)
        ctx.release();
        // idempotent at this point only because DemoEchoModule::release is a no-op; mainly
        // exercising that release() doesn't panic past zero in normal single-retire usage.
    }
}
