//! The interface a module gets to call back into the runtime from `init` and from its
//! installed message callback.
//!
//! skynet's module C API (`skynet_send`, `skynet_handle_findname`, ...) all take the calling
//! service's own `struct skynet_context *` as their first argument; `ServiceApi` plays that
//! role here, scoped to the one service it was constructed for.

use std::sync::Arc;

use crate::context::ServiceContext;
use crate::error::SendError;
use crate::handle::{Handle, Registry};
use crate::mailbox::ReadyQueue;
use crate::message::{Message, MessageType, Session};

/// What a module instance can do to the runtime from inside `init` or its message callback.
pub trait ServiceApi: Send + Sync {
    /// The handle of the service this api was constructed for.
    fn handle(&self) -> Handle;

    /// Enqueues a message, allocating a fresh session (from this service's own counter) if
    /// `type_` calls for one and `session == 0`. Mirrors `Runtime::send` with `source` fixed
    /// to this service's own handle.
    fn send(
        &self,
        destination: Handle,
        type_: MessageType,
        session: Session,
        payload: Option<Vec<u8>>,
    ) -> Result<Session, SendError>;

    /// Resolves a bound name to a handle.
    fn resolve(&self, name: &str) -> Option<Handle>;

    /// Binds `name` to this service's own handle.
    fn bind_name(&self, name: &str) -> bool;

    /// Installs (or replaces) this service's message callback. Most modules call this once,
    /// from `init`, the way a skynet module calls `skynet_callback` before returning.
    fn set_callback(&self, cb: Box<crate::context::Callback>);

    /// Requests retirement of this service (spec §4.4 "Retirement" — the in-band "EXIT"
    /// command). Marks the mailbox for release so any remaining queued messages are handed
    /// to the drop path instead of the callback, and removes the handle from the registry so
    /// no further `send`/`grab` can reach it. Safe to call from inside the message callback
    /// itself (the common case: a module handles its own `"EXIT"` request).
    fn exit(&self);
}

/// The concrete [`ServiceApi`] handed to a module during dispatch or `init`: borrows the
/// registry and ready queue for the duration of one call, owns a strong ref to its own
/// context so `send` can allocate sessions from it.
pub(crate) struct DispatchApi<'a> {
    pub ctx: Arc<ServiceContext>,
    pub registry: &'a Registry,
    pub queue: &'a ReadyQueue,
}

impl<'a> ServiceApi for DispatchApi<'a> {
    fn handle(&self) -> Handle {
        self.ctx.handle()
    }

    fn send(
        &self,
        destination: Handle,
        type_: MessageType,
        session: Session,
        payload: Option<Vec<u8>>,
    ) -> Result<Session, SendError> {
        let dest_ctx = self.registry.grab(destination).ok_or(SendError::NoSuchDestination)?;
        let session = if session == 0 && type_.allocates_session() {
            self.ctx.alloc_session()
        } else {
            session
        };
        let msg = Message { source: self.ctx.handle(), session, type_, payload };
        dest_ctx.mailbox().push(msg, self.queue);
        dest_ctx.release();
        Ok(session)
    }

    fn resolve(&self, name: &str) -> Option<Handle> {
        self.registry.find_name(name)
    }

    fn bind_name(&self, name: &str) -> bool {
        self.registry.bind_name(self.ctx.handle(), name)
    }

    fn set_callback(&self, cb: Box<crate::context::Callback>) {
        self.ctx.set_callback(cb);
    }

    fn exit(&self) {
        let handle = self.ctx.handle();
        self.ctx.mailbox().mark_release(self.queue);
        self.registry.retire(handle);
    }
}
