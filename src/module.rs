//! The module ABI: how a service's behavior is loaded and driven.
//!
//! skynet modules are `.so` files exposing name-mangled `<module>_create` / `_init` /
//! `_release` / `_signal` symbols, resolved via `dlopen`/`dlsym` against a configurable
//! search path. Two implementations share one [`Module`] trait object here:
//!
//! - [`NativeModule`]: an in-process Rust type, registered by name at startup. Used for
//!   modules that ship bundled with the runtime (the logger, the demo echo service) and
//!   for tests, where there is no `.so` to load.
//! - [`DynamicModule`]: a real `dlopen` via `libloading`, for parity with skynet's actual
//!   ABI when a service names an external `.so`.
//!
//! Both are cached by name in one [`ModuleLoader`].

use std::any::Any;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;

use crate::api::ServiceApi;
use crate::error::ModuleError;
use crate::handle::Handle;

/// The type-erased per-instance state a module's `_create` produces.
pub type Instance = Box<dyn Any + Send>;

/// Behavior shared by native and dynamically-loaded modules.
///
/// Mirrors skynet's four ABI entry points. `create` allocates instance state before the
/// service has a handle; `init` runs once the service is registered — a module almost always
/// uses its `api` argument here to call [`ServiceApi::set_callback`], installing the function
/// that will actually handle messages from then on (spec §4.4's "callback contract" is a
/// *separate* mechanism from this trait's four ABI entry points, exactly as in skynet: message
/// dispatch goes through `context->cb`, not through `_signal`). `signal` is the out-of-band
/// `signal(handle, n)` operation (spec §4.4 "Signals") used to interrupt a runaway service or
/// request a diagnostic dump — it is never invoked as part of ordinary message dispatch.
/// `release` runs on retirement.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Instance;

    /// Returns `false` to abort launch (spec §4.4 "init returns failure").
    fn init(&self, instance: &mut Instance, api: &dyn ServiceApi, args: &str) -> bool;

    fn release(&self, instance: &mut Instance, handle: Handle);

    /// Delivers an out-of-band signal (spec §4.4, §6 `signal(instance*, n: int)`). Not part of
    /// ordinary message dispatch; called synchronously by [`crate::runtime::Runtime::signal`]
    /// on the caller's own thread, which may run concurrently with this service's dispatcher.
    fn signal(&self, instance: &mut Instance, handle: Handle, n: i32);
}

/// A bundled, in-process module — the Rust analogue of linking a module statically instead
/// of `dlopen`-ing it. Most test fakes and the built-in logger/echo services use this.
///
/// There's nothing native-specific in the trait itself; a [`DynamicModule`] satisfies the
/// same interface. The alias exists so call sites can say what they mean: "a module that
/// doesn't need a `.so`" vs. "whatever module, loaded however."
pub type NativeModule = dyn Module;

/// A dynamically loaded `.so`/`.dylib` module resolved through skynet's name-mangled ABI.
///
/// Only `_init` is mandatory — it's the one entry point a module needs to install a callback
/// through. `_create`, `_release`, and `_signal` are genuinely optional in real skynet modules
/// (a module with no per-instance state has nothing for `_create` to allocate, nothing for
/// `_release` to free, and many modules never implement `signal(handle, n)` at all); a missing
/// symbol there is not a load failure, it's a no-op.
pub struct DynamicModule {
    name: String,
    _lib: Library, // keeps the mapping alive; symbols below borrow from it via raw fn ptrs
    create_fn: Option<unsafe extern "C" fn() -> *mut std::ffi::c_void>,
    init_fn: unsafe extern "C" fn(*mut std::ffi::c_void, u32, *const std::os::raw::c_char) -> i32,
    release_fn: Option<unsafe extern "C" fn(*mut std::ffi::c_void, u32)>,
    signal_fn: Option<unsafe extern "C" fn(*mut std::ffi::c_void, u32, i32)>,
}

// SAFETY: the four function pointers are plain C ABI entry points with no captured state;
// the library handle they point into is kept alive for the module's lifetime.
unsafe impl Send for DynamicModule {}
unsafe impl Sync for DynamicModule {}

impl DynamicModule {
    /// Loads the shared library at `path` and resolves `<name>_create/_init/_release/_signal`.
    unsafe fn load(name: &str, path: &Path) -> Result<Self, ModuleError> {
        let lib = Library::new(path)
            .map_err(|e| ModuleError::LoadFailed(name.to_owned(), e))?;

        macro_rules! optional_sym {
            ($suffix:literal, $ty:ty) => {{
                let sym_name = format!("{name}{}", $suffix);
                let s: Option<Symbol<$ty>> = lib.get(sym_name.as_bytes()).ok();
                s.map(|s| *s)
            }};
        }

        let create_fn = optional_sym!("_create", unsafe extern "C" fn() -> *mut std::ffi::c_void);
        let init_fn = optional_sym!(
            "_init",
            unsafe extern "C" fn(*mut std::ffi::c_void, u32, *const std::os::raw::c_char) -> i32
        )
        .ok_or_else(|| ModuleError::MissingInit(name.to_owned()))?;
        let release_fn = optional_sym!("_release", unsafe extern "C" fn(*mut std::ffi::c_void, u32));
        let signal_fn = optional_sym!("_signal", unsafe extern "C" fn(*mut std::ffi::c_void, u32, i32));

        Ok(DynamicModule {
            name: name.to_owned(),
            _lib: lib,
            create_fn,
            init_fn,
            release_fn,
            signal_fn,
        })
    }
}

/// Resolves module names to loaded [`Module`]s, caching both native registrations and
/// dynamically loaded libraries.
///
/// Native modules are registered ahead of time (bundled behavior); anything not found there
/// falls through to a search over `search_path`: `;`-separated entries mirroring skynet's
/// `cpath`, each containing a `?` placeholder that's replaced with the module name (e.g.
/// `./cservice/?.so` resolves `echo` to `./cservice/echo.so`). An entry with no `?` is treated
/// as a bare directory and tried as `<dir>/<name>.<platform extension>`, for callers that just
/// want to point at a folder.
pub struct ModuleLoader {
    search_path: Vec<String>,
    native: HashMap<String, Arc<dyn Module>>,
    cache: Mutex<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleLoader {
    pub fn new(search_path: &str) -> Self {
        ModuleLoader {
            search_path: search_path.split(';').filter(|s| !s.is_empty()).map(str::to_owned).collect(),
            native: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a module that lives in-process rather than as a `.so`.
    pub fn register_native(&mut self, module: Arc<dyn Module>) {
        self.native.insert(module.name().to_owned(), module);
    }

    /// Resolves `name`, preferring a native registration, then a cached load, then a fresh
    /// `dlopen` across the search path.
    pub fn load(&self, name: &str) -> Result<Arc<dyn Module>, ModuleError> {
        if let Some(m) = self.native.get(name) {
            return Ok(m.clone());
        }
        if let Some(m) = self.cache.lock().get(name) {
            return Ok(m.clone());
        }
        for template in &self.search_path {
            let candidate = resolve_template(template, name);
            if candidate.exists() {
                let module = unsafe { DynamicModule::load(name, &candidate)? };
                let module: Arc<dyn Module> = Arc::new(module);
                self.cache.lock().insert(name.to_owned(), module.clone());
                return Ok(module);
            }
        }
        Err(ModuleError::NotFound(name.to_owned(), self.search_path.join(";")))
    }
}

/// Resolves one `cpath`-style entry against a module name (spec §6 `cpath`): substitutes the
/// first `?` with `name`, or, for an entry with no placeholder, joins it as a plain directory.
fn resolve_template(template: &str, name: &str) -> PathBuf {
    if template.contains('?') {
        PathBuf::from(template.replacen('?', name, 1))
    } else {
        Path::new(template).join(format!("{name}.{}", dylib_extension()))
    }
}

fn dylib_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

impl Module for DynamicModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Instance {
        let raw = match self.create_fn {
            Some(f) => unsafe { f() },
            None => std::ptr::null_mut(),
        };
        Box::new(RawInstance(raw))
    }

    /// A `.so` module has no way to receive a Rust closure, so it cannot install a message
    /// callback through `api` the way a native module does — per spec §1, the embedded
    /// scripting/module runtime that would give a dynamically loaded module its own message
    /// dispatch mechanism is out of scope here. `init` only runs the C entry point; messages
    /// sent to a dynamic module fall through to the dispatcher's automatic error reply.
    fn init(&self, instance: &mut Instance, api: &dyn ServiceApi, args: &str) -> bool {
        let raw = instance.downcast_mut::<RawInstance>().expect("dynamic module instance").0;
        let c_args = std::ffi::CString::new(args).unwrap_or_default();
        unsafe { (self.init_fn)(raw, api.handle().0, c_args.as_ptr()) == 0 }
    }

    fn release(&self, instance: &mut Instance, handle: Handle) {
        if let Some(f) = self.release_fn {
            let raw = instance.downcast_mut::<RawInstance>().expect("dynamic module instance").0;
            unsafe { f(raw, handle.0) }
        }
    }

    fn signal(&self, instance: &mut Instance, handle: Handle, n: i32) {
        if let Some(f) = self.signal_fn {
            let raw = instance.downcast_mut::<RawInstance>().expect("dynamic module instance").0;
            unsafe { f(raw, handle.0, n) };
        }
    }
}

struct RawInstance(*mut std::ffi::c_void);
// SAFETY: ownership of the pointer is exclusive to the ServiceContext holding this instance,
// which is itself only ever touched by the one worker currently dispatching it.
unsafe impl Send for RawInstance {}

/// A trivial bundled module: echoes every [`crate::message::MessageType::Text`] payload back
/// to its sender as a [`crate::message::MessageType::Response`] carrying the same session.
/// Used in tests and as a minimal demo service (see SPEC_FULL.md §1 additions) — this is the
/// `echo` service from spec §8's end-to-end scenario.
pub struct DemoEchoModule;

impl Module for DemoEchoModule {
    fn name(&self) -> &str {
        "demo_echo"
    }

    fn create(&self) -> Instance {
        Box::new(())
    }

    fn init(&self, _instance: &mut Instance, api: &dyn ServiceApi, _args: &str) -> bool {
        api.set_callback(Box::new(|api, type_, session, source, payload| {
            if matches!(type_, crate::message::MessageType::Text) {
                let payload = payload.map(|p| p.to_vec());
                let _ = api.send(source, crate::message::MessageType::Response, session, payload);
            }
            true
        }));
        true
    }

    fn release(&self, _instance: &mut Instance, _handle: Handle) {}

    fn signal(&self, _instance: &mut Instance, _handle: Handle, _n: i32) {}
}

#[allow(dead_code)]
fn assert_os_str_usable(_: &OsStr) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_module_resolves_without_search_path() {
        let mut loader = ModuleLoader::new("");
        loader.register_native(Arc::new(DemoEchoModule));
        let m = loader.load("demo_echo").expect("native module must resolve");
        assert_eq!(m.name(), "demo_echo");
    }

    #[test]
    fn question_mark_template_substitutes_the_module_name() {
        assert_eq!(resolve_template("./service/?.so", "echo"), PathBuf::from("./service/echo.so"));
        assert_eq!(resolve_template("/a", "echo"), PathBuf::from("/a").join(format!("echo.{}", dylib_extension())));
    }

    #[test]
    fn unknown_module_reports_search_path_in_error() {
        let loader = ModuleLoader::new("/a;/b");
        let err = loader.load("nope").unwrap_err();
        match err {
            ModuleError::NotFound(name, path) => {
                assert_eq!(name, "nope");
                assert_eq!(path, "/a;/b");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
