//! pygnumake: call Python from GNU make
//!
//! Built as a loadable object for make's `load` directive. Once loaded,
//! makefiles get `python-eval`, `python-exec`, `python-file` and
//! `python-mod`, and Python code gets the `gnumake` module for registering
//! its own functions, expanding text and evaluating makefile syntax.
//!
//! ```make
//! load libpygnumake.so(pygnumake_gmk_setup)
//! $(python-exec import gnumake; gnumake.add_function("greet", lambda n: "hello " + n, 1, 1))
//! $(info $(greet world))
//! ```
//!
//! Everything that talks to make goes through the [`Host`] trait, so the
//! bridge runs the same against [`GmkApi`] inside make and [`MemoryHost`] in
//! tests.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod escape;
pub mod host;
pub mod library;
pub mod logging;
pub mod marshal;
pub mod python;
pub mod report;
pub mod session;

// Re-export commonly used items
pub use bridge::Outcome;
pub use config::{Config, ConfigError};
pub use errors::{BridgeError, SymbolError};
pub use host::{
    CallRejected, Evaluation, FunctionDescriptor, GmkApi, Host, HostString, Location, MemoryHost,
};
pub use report::Reported;
pub use session::Session;
