//! Hardware watchdog character devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

// _IOR('W', 5, int) and _IOWR('W', 6, int)
const WDIOC_KEEPALIVE: libc::c_ulong = 0x8004_5705;
const WDIOC_SETTIMEOUT: libc::c_ulong = 0xc004_5706;

/// An open watchdog.
pub trait Watchdog: Send {
    /// Sets the timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Feeds the watchdog.
    fn keepalive(&mut self) -> io::Result<()>;

    /// Disarms and closes the device.
    fn magic_close(self: Box<Self>) -> io::Result<()>;
}

/// Opens watchdog devices.
pub trait WatchdogOpener: Send + Sync {
    /// Opens `device` read-write.
    fn open(&self, device: &str) -> io::Result<Box<dyn Watchdog>>;
}

/// A watchdog character device.
#[derive(Debug)]
pub struct DeviceWatchdog {
    file: File,
}

impl DeviceWatchdog {
    fn ioctl(&self, request: libc::c_ulong, arg: &mut libc::c_int) -> io::Result<()> {
        // SAFETY: both requests take a pointer to an int which outlives the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut libc::c_int) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Watchdog for DeviceWatchdog {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let mut secs = libc::c_int::try_from(timeout.as_secs()).unwrap_or(libc::c_int::MAX);
        self.ioctl(WDIOC_SETTIMEOUT, &mut secs)
    }

    fn keepalive(&mut self) -> io::Result<()> {
        let mut unused = 0;
        self.ioctl(WDIOC_KEEPALIVE, &mut unused)
    }

    fn magic_close(mut self: Box<Self>) -> io::Result<()> {
        self.file.write_all(b"V")
    }
}

/// Opens real devices.
#[derive(Debug, Default)]
pub struct DeviceOpener;

impl WatchdogOpener for DeviceOpener {
    fn open(&self, device: &str) -> io::Result<Box<dyn Watchdog>> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        Ok(Box::new(DeviceWatchdog { file }))
    }
}

/// Feed interval for a timeout: a third of it.
pub fn feed_interval(timeout: Duration) -> Duration {
    timeout / 3
}
