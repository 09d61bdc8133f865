//! Command descriptors, argument binding, the command registry and built-ins

pub mod args;
pub mod builtin;
pub mod context;
pub mod descriptor;
pub mod registry;

pub use args::{bind_args, BoundArgs};
pub use builtin::{builtin_commands, register_builtins, verify_descriptor, VerifyEvidence};
pub use context::HandlerContext;
pub use descriptor::{
    handler_fn, ArgSpec, ArgType, Capability, CommandDescriptor, CommandHandler, CommandOrigin,
    CommandOutput, FnHandler,
};
pub use registry::{CommandRegistry, RegistryChange, RegistryChangeKind};
