//! Service addresses and the registry that hands them out.
//!
//! A [`Handle`] is a 32-bit opaque address: the high 8 bits name the cluster node
//! ("harbor"), the low 24 bits are a locally-unique id. `0` is reserved for "self / system".

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::ServiceContext;

/// Bits 23..0 of a handle; local ids are 1-based, 0 is reserved.
pub const LOCAL_MASK: u32 = 0x00FF_FFFF;
const HARBOR_SHIFT: u32 = 24;
const DEFAULT_SLOT_SIZE: usize = 4;
const MAX_SLOT_SIZE: usize = 1 << 30;

/// A service address: harbor id in the high byte, local id in the low 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl Handle {
    /// The reserved "system / no destination" handle.
    pub const SYSTEM: Handle = Handle(0);

    pub fn harbor(self) -> u8 {
        (self.0 >> HARBOR_SHIFT) as u8
    }

    pub fn local(self) -> u32 {
        self.0 & LOCAL_MASK
    }

    pub fn is_system(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

/// Parses the `:HHHHHHHH` textual form.
impl FromStr for Handle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix(':').unwrap_or(s);
        u32::from_str_radix(digits, 16).map(Handle)
    }
}

struct NamedHandle {
    name: String,
    handle: Handle,
}

struct RegistryInner {
    harbor: u8,
    slots: Vec<Option<Arc<ServiceContext>>>,
    next_index: u32,
    /// Lexicographically sorted by `name`; binary-searched for lookup.
    names: Vec<NamedHandle>,
}

impl RegistryInner {
    fn slot_index(&self, handle: Handle) -> usize {
        (handle.0 & (self.slots.len() as u32 - 1)) as usize
    }

    fn grow(&mut self) {
        let old_size = self.slots.len();
        let new_size = old_size * 2;
        assert!(new_size <= MAX_SLOT_SIZE, "handle registry exceeded max slot size");
        let mut new_slots: Vec<Option<Arc<ServiceContext>>> = (0..new_size).map(|_| None).collect();
        for slot in self.slots.drain(..) {
            if let Some(ctx) = slot {
                let h = ctx.handle();
                let idx = (h.0 & (new_size as u32 - 1)) as usize;
                debug_assert!(new_slots[idx].is_none(), "rehash collision");
                new_slots[idx] = Some(ctx);
            }
        }
        self.slots = new_slots;
    }
}

/// Allocates handles, maps them to [`ServiceContext`]s, and maintains the sorted name table.
///
/// Mirrors a skynet-style handle table: an open-addressed slot array plus a separately
/// sorted `(name, handle)` list, guarded by one reader-writer lock.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new(harbor: u8) -> Self {
        Registry {
            inner: RwLock::new(RegistryInner {
                harbor,
                slots: (0..DEFAULT_SLOT_SIZE).map(|_| None).collect(),
                next_index: 1,
                names: Vec::new(),
            }),
        }
    }

    /// Allocates a fresh handle for `ctx` and links it into the slot table.
    ///
    /// Probes starting at the rolling `next_index`; doubles the table (rehashing existing
    /// entries) if a full pass finds no free slot.
    pub fn register(&self, ctx: Arc<ServiceContext>) -> Handle {
        let mut inner = self.inner.write();
        loop {
            let slot_size = inner.slots.len();
            let mut local = inner.next_index;
            for _ in 0..slot_size {
                if local & !LOCAL_MASK != 0 || local == 0 {
                    local = 1;
                }
                let idx = (local & (slot_size as u32 - 1)) as usize;
                if inner.slots[idx].is_none() {
                    inner.slots[idx] = Some(ctx);
                    inner.next_index = local.wrapping_add(1);
                    let harbor = inner.harbor;
                    return Handle(local | ((harbor as u32) << HARBOR_SHIFT));
                }
                local = local.wrapping_add(1);
            }
            inner.grow();
        }
    }

    /// Removes `handle` from the slot table and name list, decrementing the context's
    /// refcount. Returns `true` if a service was actually removed.
    pub fn retire(&self, handle: Handle) -> bool {
        let ctx = {
            let mut inner = self.inner.write();
            let idx = inner.slot_index(handle);
            let occupant_matches = matches!(&inner.slots[idx], Some(c) if c.handle() == handle);
            if !occupant_matches {
                return false;
            }
            let ctx = inner.slots[idx].take().unwrap();
            inner.names.retain(|n| n.handle != handle);
            ctx
        };
        ctx.release();
        true
    }

    /// Retires every currently-registered service. Used at shutdown.
    pub fn retire_all(&self) {
        loop {
            let handle = {
                let inner = self.inner.read();
                inner.slots.iter().flatten().map(|c| c.handle()).next()
            };
            match handle {
                Some(h) => {
                    self.retire(h);
                }
                None => return,
            }
        }
    }

    /// Looks up `handle` and, if live, increments its refcount and returns it.
    pub fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let inner = self.inner.read();
        let idx = inner.slot_index(handle);
        match &inner.slots[idx] {
            Some(ctx) if ctx.handle() == handle => {
                ctx.grab();
                Some(ctx.clone())
            }
            _ => None,
        }
    }

    /// Binds `name` to `handle`. Fails if the name is already taken.
    pub fn bind_name(&self, handle: Handle, name: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.names.binary_search_by(|n| n.name.as_str().cmp(name)) {
            Ok(_) => false,
            Err(pos) => {
                inner.names.insert(
                    pos,
                    NamedHandle {
                        name: name.to_owned(),
                        handle,
                    },
                );
                true
            }
        }
    }

    /// Resolves `name` to a handle, or `None` on miss.
    pub fn find_name(&self, name: &str) -> Option<Handle> {
        let inner = self.inner.read();
        inner
            .names
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|pos| inner.names[pos].handle)
    }

    /// Snapshot of the name table in lexicographic order. For diagnostics/tests.
    pub fn names(&self) -> Vec<(String, Handle)> {
        let inner = self.inner.read();
        inner.names.iter().map(|n| (n.name.clone(), n.handle)).collect()
    }

    pub fn harbor(&self) -> u8 {
        self.inner.read().harbor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use crate::mailbox::Mailbox;
    use crate::module::{DemoEchoModule, Module};
    use std::sync::Arc;

    fn fake_ctx() -> Arc<ServiceContext> {
        let module: Arc<dyn Module> = Arc::new(DemoEchoModule);
        let mailbox = Arc::new(Mailbox::new(Handle(0)));
        ServiceContext::new_unregistered(module, mailbox)
    }

    #[test]
    fn uniqueness_across_register_retire() {
        let reg = Registry::new(1);
        let mut live = Vec::new();
        for _ in 0..200 {
            let ctx = fake_ctx();
            let h = reg.register(ctx.clone());
            ctx.set_handle(h);
            assert!(
                live.iter().all(|&x: &Handle| x != h),
                "handle {h} reused while still live"
            );
            live.push(h);
            if live.len() > 3 {
                let gone = live.remove(0);
                assert!(reg.retire(gone));
            }
        }
    }

    #[test]
    fn slot_growth_keeps_existing_reachable() {
        let reg = Registry::new(1);
        let mut handles = Vec::new();
        // DEFAULT_SLOT_SIZE is 4; register enough services to force at least one doubling.
        for _ in 0..20 {
            let ctx = fake_ctx();
            let h = reg.register(ctx.clone());
            ctx.set_handle(h);
            handles.push(h);
        }
        for h in handles {
            let got = reg.grab(h);
            assert!(got.is_some(), "handle {h} unreachable after growth");
            got.unwrap().release();
        }
    }

    #[test]
    fn name_uniqueness_and_ordering() {
        let reg = Registry::new(1);
        let ctx1 = fake_ctx();
        let h1 = reg.register(ctx1.clone());
        ctx1.set_handle(h1);
        let ctx2 = fake_ctx();
        let h2 = reg.register(ctx2.clone());
        ctx2.set_handle(h2);

        assert!(reg.bind_name(h1, "zebra"));
        assert!(reg.bind_name(h2, "apple"));
        assert!(!reg.bind_name(h2, "zebra"), "duplicate name must fail");

        assert_eq!(reg.find_name("zebra"), Some(h1));
        assert_eq!(reg.find_name("apple"), Some(h2));
        assert_eq!(reg.find_name("missing"), None);

        let names: Vec<String> = reg.names().into_iter().map(|(n, _)| n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "name table must be lexicographically sorted");
    }

    #[test]
    fn retire_removes_name_binding() {
        let reg = Registry::new(1);
        let ctx = fake_ctx();
        let h = reg.register(ctx.clone());
        ctx.set_handle(h);
        assert!(reg.bind_name(h, ".svc"));
        assert_eq!(reg.find_name(".svc"), Some(h));
        assert!(reg.retire(h));
        assert_eq!(reg.find_name(".svc"), None);
    }

    #[test]
    fn grab_fails_after_retire() {
        let reg = Registry::new(1);
        let ctx = fake_ctx();
        let h = reg.register(ctx.clone());
        ctx.set_handle(h);
        assert!(reg.grab(h).is_some());
        // undo the extra refcount from the successful grab above
        ctx.release();
        assert!(reg.retire(h));
        assert!(reg.grab(h).is_none());
    }

    #[test]
    fn send_to_unregistered_handle_is_miss() {
        let reg = Registry::new(1);
        assert!(reg.grab(Handle(0x01FF_FFFF)).is_none());
    }
}
