//! Local proxy client process supervision.

pub mod command;
pub mod registry;
pub mod supervisor;

pub use command::{ClientKind, ClientPaths};
pub use registry::{terminate_by_name, ProcessRegistry, RegistryGuard};
pub use supervisor::{ClientHandle, ClientLauncher, ClientSupervisor};
