//! One "tick" of work: pop a ready mailbox, drain a weight-scaled batch of its messages.

use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

use crate::api::DispatchApi;
use crate::context::ServiceContext;
use crate::handle::Registry;
use crate::mailbox::{Mailbox, Pop, ReadyQueue};
use crate::message::{Message, MessageType};
use crate::monitor::Monitor;

/// What a single call to [`dispatch_one`] accomplished, for the worker loop's bookkeeping.
pub enum Outcome {
    /// No mailbox was ready; the caller should consider sleeping.
    Idle,
    /// A mailbox was drained. `messages` is how many were actually processed.
    Drained { handle: crate::handle::Handle, messages: usize },
}

/// Pops one ready mailbox and drains up to `k = weight == -1 { 1 } else { max(1, n >> weight) }`
/// messages from it, where `n` is the mailbox's length at the start of the tick. Re-queues
/// the mailbox afterward if it still holds work.
///
/// `weight` comes from the calling worker's static weight table (see [`crate::worker`]); a
/// more negative-leaning (lower, i.e. `-1`) weight processes one message per tick so a busy
/// worker yields quickly, while a higher weight lets an idle worker greedily drain large
/// backlogs.
///
/// `monitor`/`worker_index` are touched around every individual message (spec §4.5 step 3),
/// not once for the whole batch: `monitor.begin` records the destination just before the
/// callback runs, `monitor.end` clears it right after, so the sampling thread can name the
/// exact service a worker is wedged on mid-batch instead of just "the last mailbox it picked
/// up," and never mistakes an idle worker between dispatches for a stuck one.
pub fn dispatch_one(registry: &Registry, queue: &ReadyQueue, weight: i32, monitor: &Monitor, worker_index: usize) -> Outcome {
    let mailbox = match queue.pop() {
        Some(m) => m,
        None => return Outcome::Idle,
    };

    let ctx = match registry.grab(mailbox.handle()) {
        Some(ctx) => ctx,
        None => {
            // Handle was retired between being queued and being picked up; drain and drop.
            drain_orphan(&mailbox);
            return Outcome::Idle;
        }
    };

    if mailbox.is_released() {
        mailbox.drain_on_release(|_msg| {});
        registry.retire(mailbox.handle());
        ctx.release();
        return Outcome::Idle;
    }

    let n = mailbox.length();
    let k = if weight == -1 { 1 } else { (n >> weight).max(1) };

    let start = Instant::now();
    let mut processed = 0;
    for _ in 0..k {
        if mailbox.is_released() {
            // The callback retired itself mid-batch (spec §4.4 "Retirement"): stop handing
            // it further messages from this tick. Whatever's left is picked up by the
            // `is_released` check above the next time a worker dequeues this mailbox.
            break;
        }
        match mailbox.pop() {
            Pop::Message { message, overload } => {
                if let Some(len) = overload {
                    warn!(handle = %mailbox.handle(), len, "mailbox overload threshold doubled");
                }
                monitor.begin(worker_index, mailbox.handle());
                deliver(&ctx, &mailbox, queue, registry, message);
                monitor.end(worker_index);
                processed += 1;
            }
            Pop::Empty => break,
        }
    }
    ctx.add_cpu_ns(start.elapsed().as_nanos() as u64);

    let handle = mailbox.handle();
    if mailbox.length() > 0 {
        // Still has work: re-link for another tick instead of waiting for the next push.
        queue.push(mailbox);
    }
    ctx.release();

    trace!(handle = %handle, processed, "tick complete");
    Outcome::Drained { handle, messages: processed }
}

/// Delivers one message to the service's installed callback (spec §4.4's "callback
/// contract"), *not* the module's `_signal` ABI entry point — that one is reserved for the
/// out-of-band `signal(handle, n)` operation and is never invoked from the dispatch path (see
/// [`crate::module::Module`]'s docs). A service with no callback installed (or one that
/// returns `false`) gets an automatic [`MessageType::Error`] reply when the message carried a
/// session worth replying to.
fn deliver(ctx: &Arc<ServiceContext>, mailbox: &Arc<Mailbox>, queue: &ReadyQueue, registry: &Registry, message: Message) {
    let api = DispatchApi { ctx: ctx.clone(), registry, queue };
    let handled = match ctx.take_callback() {
        Some(mut cb) => {
            let consumed = cb(&api, message.type_, message.session, message.source, message.payload.as_deref());
            ctx.put_callback_back(cb);
            consumed
        }
        None => false,
    };
    if !handled && message.session != 0 {
        reply_error(ctx, mailbox, queue, registry, &message);
    }
}

fn reply_error(
    _ctx: &Arc<ServiceContext>,
    mailbox: &Arc<Mailbox>,
    queue: &ReadyQueue,
    registry: &Registry,
    message: &Message,
) {
    if let Some(source_ctx) = registry.grab(message.source) {
        let reply = Message {
            source: mailbox.handle(),
            session: message.session,
            type_: MessageType::Error,
            payload: None,
        };
        source_ctx.mailbox().push(reply, queue);
        source_ctx.release();
    }
}

fn drain_orphan(mailbox: &Arc<Mailbox>) {
    mailbox.drain_on_release(|_msg| {});
}

/// Test-only module whose callback retires itself on the first [`MessageType::System`]
/// message it sees, leaving anything queued after that undelivered — exercises spec §4.4's
/// "a service requests exit by an in-band command" retirement path end to end.
#[cfg(test)]
struct ExitOnSystemModule;

#[cfg(test)]
impl crate::module::Module for ExitOnSystemModule {
    fn name(&self) -> &str {
        "exit_on_system"
    }

    fn create(&self) -> crate::module::Instance {
        Box::new(())
    }

    fn init(&self, _instance: &mut crate::module::Instance, api: &dyn crate::api::ServiceApi, _args: &str) -> bool {
        api.set_callback(Box::new(|api, type_, _session, _source, _payload| {
            if matches!(type_, MessageType::System) {
                api.exit();
            }
            true
        }));
        true
    }

    fn release(&self, _instance: &mut crate::module::Instance, _handle: Handle) {}
    fn signal(&self, _instance: &mut crate::module::Instance, _handle: Handle, _n: i32) {}
}

/// Test-only module that tracks, via shared atomics, how many concurrent invocations of its
/// own callback are in flight at once — the instrument spec §8's testable property 5
/// ("at-most-one dispatcher") calls for.
#[cfg(test)]
struct AtMostOneModule {
    current: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    max_seen: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl crate::module::Module for AtMostOneModule {
    fn name(&self) -> &str {
        "at_most_one"
    }

    fn create(&self) -> crate::module::Instance {
        Box::new(())
    }

    fn init(&self, _instance: &mut crate::module::Instance, api: &dyn crate::api::ServiceApi, _args: &str) -> bool {
        use std::sync::atomic::Ordering;
        let current = self.current.clone();
        let max_seen = self.max_seen.clone();
        api.set_callback(Box::new(move |_api, _type_, _session, _source, _payload| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::yield_now();
            current.fetch_sub(1, Ordering::SeqCst);
            true
        }));
        true
    }

    fn release(&self, _instance: &mut crate::module::Instance, _handle: Handle) {}
    fn signal(&self, _instance: &mut crate::module::Instance, _handle: Handle, _n: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::module::{DemoEchoModule, Module};

    /// A single-slot monitor for tests that don't care about liveness tracking — they just
    /// need something to hand `dispatch_one`'s new `monitor`/`worker_index` parameters.
    fn test_monitor() -> Monitor {
        Monitor::new(1)
    }

    fn setup() -> (Registry, ReadyQueue, Handle) {
        let registry = Registry::new(1);
        let queue = ReadyQueue::new();
        let module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox.clone());
        let handle = registry.register(ctx.clone());
        ctx.set_handle(handle);
        mailbox.set_handle(handle);
        mailbox.pop(); // drain the implicit in_global=true startup state to idle
        (registry, queue, handle)
    }

    #[test]
    fn idle_queue_reports_idle() {
        let (registry, queue, _h) = setup();
        let monitor = test_monitor();
        assert!(matches!(dispatch_one(&registry, &queue, 0, &monitor, 0), Outcome::Idle));
    }

    #[test]
    fn weight_minus_one_processes_exactly_one_message() {
        let registry = Registry::new(1);
        let queue = ReadyQueue::new();
        let module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox.clone());
        let handle = registry.register(ctx.clone());
        ctx.set_handle(handle);
        mailbox.set_handle(handle);

        mailbox.pop(); // drain implicit in_global, go idle
        for _ in 0..5 {
            mailbox.push(
                Message { source: Handle(1), session: 0, type_: MessageType::Text, payload: None },
                &queue,
            );
        }
        assert!(!queue.is_empty());
        let popped = queue.pop().unwrap();
        queue.push(popped); // put back so dispatch_one's own pop sees it

        let monitor = test_monitor();
        match dispatch_one(&registry, &queue, -1, &monitor, 0) {
            Outcome::Drained { messages, .. } => assert_eq!(messages, 1),
            Outcome::Idle => panic!("expected work"),
        }
        assert_eq!(mailbox.length(), 4, "weight -1 must drain exactly one message");
    }

    #[test]
    fn echo_service_replies_to_its_sender_through_dispatch_one() {
        let registry = Registry::new(1);
        let queue = ReadyQueue::new();

        // the client: just needs a handle + mailbox to receive the reply into.
        let client_module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let client_mailbox = Arc::new(Mailbox::new(Handle(0)));
        let client_ctx = ServiceContext::new_unregistered(client_module, client_mailbox.clone());
        let client = registry.register(client_ctx.clone());
        client_ctx.set_handle(client);
        client_mailbox.set_handle(client);
        client_mailbox.pop(); // idle

        // the echo service, with its callback actually installed via init().
        let echo_module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let echo_mailbox = Arc::new(Mailbox::new(Handle(0)));
        let echo_ctx = ServiceContext::new_unregistered(echo_module, echo_mailbox.clone());
        let echo = registry.register(echo_ctx.clone());
        echo_ctx.set_handle(echo);
        echo_mailbox.set_handle(echo);
        echo_mailbox.pop(); // idle
        let api = crate::api::DispatchApi { ctx: echo_ctx.clone(), registry: &registry, queue: &queue };
        echo_ctx.with_instance(|instance| echo_ctx.module().init(instance, &api, ""));

        let session = client_ctx.alloc_session();
        echo_mailbox.push(
            Message { source: client, session, type_: MessageType::Text, payload: Some(b"hi".to_vec()) },
            &queue,
        );

        let monitor = test_monitor();
        match dispatch_one(&registry, &queue, 0, &monitor, 0) {
            Outcome::Drained { messages, .. } => assert_eq!(messages, 1),
            Outcome::Idle => panic!("expected the echo service's mailbox to be dispatched"),
        }

        match client_mailbox.pop() {
            Pop::Message { message, .. } => {
                assert_eq!(message.source, echo);
                assert_eq!(message.session, session);
                assert!(matches!(message.type_, MessageType::Response));
                assert_eq!(message.payload.as_deref(), Some(b"hi".as_slice()));
            }
            Pop::Empty => panic!("echo service never replied"),
        }
    }

    #[test]
    fn exit_mid_batch_stops_delivery_and_retires_the_service() {
        let registry = Registry::new(1);
        let queue = ReadyQueue::new();

        let module: Arc<dyn Module> = Arc::new(ExitOnSystemModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox.clone());
        let handle = registry.register(ctx.clone());
        ctx.set_handle(handle);
        mailbox.set_handle(handle);
        let api = crate::api::DispatchApi { ctx: ctx.clone(), registry: &registry, queue: &queue };
        assert!(ctx.with_instance(|instance| ctx.module().init(instance, &api, "")));
        mailbox.pop(); // drain the constructor's implicit in_global state to idle

        // The first message triggers `exit()`; the second should never reach the callback.
        mailbox.push(
            Message { source: Handle(1), session: 0, type_: MessageType::System, payload: None },
            &queue,
        );
        mailbox.push(
            Message { source: Handle(1), session: 0, type_: MessageType::Text, payload: None },
            &queue,
        );

        let monitor = test_monitor();
        match dispatch_one(&registry, &queue, 0, &monitor, 0) {
            Outcome::Drained { messages, .. } => assert_eq!(messages, 1, "only the exit-triggering message is delivered"),
            Outcome::Idle => panic!("expected the mailbox to be dispatched"),
        }

        assert!(registry.grab(handle).is_none(), "exit() must retire the handle from the registry");
        assert_eq!(mailbox.length(), 1, "the undelivered message is still queued for the drop path");
        assert!(mailbox.is_released(), "mark_release must have run");

        // Simulate a worker later picking the mailbox back up: it must drain, not dispatch.
        match dispatch_one(&registry, &queue, 0, &monitor, 0) {
            Outcome::Idle => {}
            Outcome::Drained { .. } => panic!("a released mailbox must never reach the callback again"),
        }
        assert_eq!(mailbox.length(), 0, "drain_on_release must have consumed the remaining message");
    }

    #[test]
    fn at_most_one_worker_dispatches_a_service_at_a_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        const WORKER_THREADS: usize = 8;
        const MESSAGE_COUNT: usize = 400;

        let registry = Arc::new(Registry::new(1));
        let queue = Arc::new(ReadyQueue::new());

        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let module: Arc<dyn Module> =
            Arc::new(AtMostOneModule { current: current.clone(), max_seen: max_seen.clone() });
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        let ctx = ServiceContext::new_unregistered(module, mailbox.clone());
        let handle = registry.register(ctx.clone());
        ctx.set_handle(handle);
        mailbox.set_handle(handle);
        let api = crate::api::DispatchApi { ctx: ctx.clone(), registry: &registry, queue: &queue };
        assert!(ctx.with_instance(|instance| ctx.module().init(instance, &api, "")));
        mailbox.pop(); // drain the constructor's implicit in_global state to idle

        for i in 0..MESSAGE_COUNT as u32 {
            mailbox.push(
                Message { source: Handle(1), session: 0, type_: MessageType::Text, payload: Some(vec![i as u8]) },
                &queue,
            );
        }

        let processed = Arc::new(AtomicUsize::new(0));
        let monitor = Arc::new(Monitor::new(WORKER_THREADS));
        let threads: Vec<_> = (0..WORKER_THREADS)
            .map(|worker_index| {
                let registry = registry.clone();
                let queue = queue.clone();
                let processed = processed.clone();
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    while processed.load(Ordering::SeqCst) < MESSAGE_COUNT {
                        match dispatch_one(&registry, &queue, -1, &monitor, worker_index) {
                            Outcome::Drained { messages, .. } => {
                                processed.fetch_add(messages, Ordering::SeqCst);
                            }
                            Outcome::Idle => std::thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(processed.load(Ordering::SeqCst), MESSAGE_COUNT);
        assert_eq!(
            max_seen.load(Ordering::SeqCst),
            1,
            "two workers must never run this service's callback concurrently"
        );
    }
}
