//! Kernel log records from `/dev/kmsg`.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "authpriv", "ftp", "ntp",
    "security", "console", "solaris-cron", "local0", "local1", "local2", "local3", "local4", "local5", "local6",
    "local7",
];

/// One kernel log record.
#[derive(Debug, Clone, PartialEq)]
pub struct KmsgRecord {
    /// Syslog priority, 0 (emergency) to 7 (debug).
    pub priority: u8,
    /// Syslog facility number.
    pub facility: u8,
    /// Sequence number.
    pub sequence: u64,
    /// Monotonic timestamp.
    pub clock: Duration,
    /// Wall clock time derived from the boot time.
    pub timestamp: DateTime<Utc>,
    /// Message text.
    pub message: String,
}

impl KmsgRecord {
    /// Parses `prefix;message` where prefix is `pri,seq,usec,flags[,...]`.
    pub fn parse(raw: &str, boot_time: SystemTime) -> Option<KmsgRecord> {
        let (prefix, message) = raw.split_once(';')?;
        let mut fields = prefix.split(',');

        let pri: u32 = fields.next()?.parse().ok()?;
        let sequence: u64 = fields.next()?.parse().ok()?;
        let usec: u64 = fields.next()?.parse().ok()?;

        // Continuation lines (" KEY=value") follow the message.
        let message = message.lines().next().unwrap_or_default().to_string();
        let clock = Duration::from_micros(usec);

        Some(KmsgRecord {
            priority: (pri & 7) as u8,
            facility: (pri >> 3) as u8,
            sequence,
            clock,
            timestamp: DateTime::<Utc>::from(boot_time + clock),
            message,
        })
    }

    /// Four-level severity.
    pub fn level(&self) -> &'static str {
        match self.priority {
            0..=3 => "error",
            4 => "warn",
            5 | 6 => "info",
            _ => "debug",
        }
    }

    /// Facility name.
    pub fn facility_name(&self) -> &'static str {
        FACILITIES.get(self.facility as usize).copied().unwrap_or("unknown")
    }

    /// JSON-lines wire record.
    pub fn to_wire(&self) -> WireRecord<'_> {
        WireRecord {
            msg: &self.message,
            time: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            level: self.level(),
            facility: self.facility_name(),
            seq: self.sequence,
            clock: self.clock.as_micros() as u64,
            priority: self.priority,
        }
    }
}

/// Record shape sent to kernel log destinations.
#[derive(Debug, Serialize)]
pub struct WireRecord<'a> {
    /// Message.
    pub msg: &'a str,
    /// RFC 3339 time.
    pub time: String,
    /// Severity.
    pub level: &'static str,
    /// Facility name.
    pub facility: &'static str,
    /// Sequence number.
    pub seq: u64,
    /// Monotonic clock, microseconds.
    pub clock: u64,
    /// Syslog priority.
    pub priority: u8,
}

/// Wall clock time of boot, from the monotonic clock.
pub fn boot_time() -> SystemTime {
    // SAFETY: timespec is plain data filled by clock_gettime.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let uptime = if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    } else {
        Duration::ZERO
    };
    SystemTime::now() - uptime
}

/// Follows the kernel log on a blocking thread; records arrive on the channel.
///
/// The thread stops when the receiver is dropped (checked after each record).
pub fn follow(path: &Path) -> io::Result<mpsc::Receiver<KmsgRecord>> {
    let mut file = File::open(path)?;
    let (tx, rx) = mpsc::channel(1024);
    let boot = boot_time();

    std::thread::Builder::new().name("kmsg-reader".to_string()).spawn(move || {
        let mut buf = vec![0u8; 8192];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    let raw = String::from_utf8_lossy(&buf[..n]);
                    if let Some(record) = KmsgRecord::parse(&raw, boot) {
                        if tx.blocking_send(record).is_err() {
                            return;
                        }
                    }
                }
                // Records were overwritten before we read them.
                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(error = %err, "kernel log reader stopped");
                    return;
                }
            }
        }
    })?;

    Ok(rx)
}
