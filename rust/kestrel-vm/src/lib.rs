//! Kestrel VM: stack-based interpreter for compiled BASIC images.

pub mod builtins;
pub mod config;
pub mod host;
pub mod pattern;
pub mod vm;

pub use config::{ConfigError, DefaultMemberPolicy, VmConfig};
pub use host::{
    BufferIo, DebugHook, DebugMode, ExtendedSearch, ForeignCall, HostSymbol, IoChannels, OpenMode,
};
pub use vm::{ExecControl, Outcome, RunState, StackFrame, Vm, VmError};
