//! Plugin compilation and invocation.

pub mod compiler;
pub mod error;
pub mod runtime;
pub mod unit;

pub use compiler::{Compiler, FragmentState, body_hash};
pub use error::{CompileError, Diagnostic, InvocationError};
pub use runtime::{ExtensionPoint, FragmentDiagnostic, NavigationItem, PluginCheck, PluginRuntime};
pub use unit::{Callable, CompiledUnit, Limits};
