//! Kernel reconcilers: command line, parameters and modules.

mod cmdline;
mod modules;
mod params;

pub use cmdline::KernelCmdlineController;
pub use modules::{KernelModuleSpecController, LoadedKernelModuleController, MODULES_POLL_INTERVAL};
pub use params::KernelParamSpecController;
