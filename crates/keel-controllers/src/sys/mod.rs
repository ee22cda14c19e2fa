//! Side effects on the host: kernel parameters, modules, watchdog, cgroups,
//! kernel log, memfd bind mounts, filesystem scrubs and meta keys.

pub mod cgroups;
pub mod kernel_param;
pub mod kmsg;
pub mod memfd;
pub mod meta;
pub mod modules;
pub mod pidfd;
pub mod scrub;
pub mod watchdog;
