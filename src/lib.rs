//! deai - dynamic object runtime for a scriptable automation daemon.
//!
//! Scripts and native plugins interoperate through one uniform abstraction:
//! an object, which is a bag of named members, a possibly callable thing, an
//! event source and an owner of a destructor. The crate provides:
//! - A variant type system with cross-language value semantics
//! - The object model: members, reference counting, destruction states
//! - Typed methods and closures with dynamic argument conversion
//! - Signals and listeners with lifetime coupling to the event loop
//! - A cooperative event loop publishing timers, periodic ticks,
//!   fd readiness and filesystem watches as objects

pub mod callable;
pub mod error;
pub mod event;
pub mod file;
pub mod log;
pub mod object;
pub mod plugin;
pub mod root;
pub mod signal;
pub mod types;

pub use callable::{new_closure, Capture, TypedFunction, MAX_NARGS};
pub use error::{Error, Result};
pub use event::{EventLoop, Interest};
pub use object::{Member, Object, ObjectState, WeakObject};
pub use plugin::{load_plugin, load_plugin_from_dir, register_plugin, PluginInit};
pub use root::{Root, WeakRoot};
pub use signal::{listen_to_destroyed, Listener};
pub use types::{Array, FromValue, IntoValue, Type, Value};
