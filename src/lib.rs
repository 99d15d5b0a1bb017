/*! A lightweight, skynet-style actor runtime: isolated services, each with one mailbox and
one handle, scheduled onto a fixed pool of OS threads.

```no_run
use mailrt::config::Config;
use mailrt::runtime::Runtime;

let rt = Runtime::new(Config::default());
rt.boot().expect("bootstrap failed");
```

A service never shares state with another service directly; all communication goes through
`Runtime::send`, which drops a [`message::Message`] into the destination's mailbox and, if
the mailbox was idle, links it onto the global ready queue for a worker to pick up. At most
one worker ever dispatches a given mailbox at a time — see [`mailbox`] for how that's
guaranteed without a per-mailbox lock on the hot path.
*/

pub mod api;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod logger;
pub mod mailbox;
pub mod message;
pub mod module;
pub mod monitor;
pub mod runtime;
pub mod timer;
pub mod worker;

pub use api::ServiceApi;
pub use config::Config;
pub use error::{BootstrapError, LaunchError, ModuleError, SendError};
pub use handle::{Handle, Registry};
pub use mailbox::{Mailbox, ReadyQueue};
pub use message::{Message, MessageType, Session};
pub use module::{Module, ModuleLoader, NativeModule};
pub use runtime::Runtime;
