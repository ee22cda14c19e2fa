//! Kernel log delivery to remote JSON-lines collectors.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_resources::runtime::KmsgLogConfig;
use keel_resources::services::NetworkStatus;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Drainer, Input, Output, ResultExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sys::kmsg::{self, KmsgRecord};

/// Silence on the kernel log after which a drain completes.
pub const DRAIN_QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Starts following the kernel log.
pub type KmsgFollower = Arc<dyn Fn() -> io::Result<mpsc::Receiver<KmsgRecord>> + Send + Sync>;

/// Follower reading `path` (normally `/dev/kmsg`).
pub fn kmsg_follower(path: impl Into<PathBuf>) -> KmsgFollower {
    let path = path.into();
    Arc::new(move || kmsg::follow(&path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    Udp,
}

/// Parses `tcp://host:port` or `udp://host:port`.
fn parse_destination(url: &str) -> io::Result<(Transport, String)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{url}: {msg}"));

    let uri: http::Uri = url.parse().map_err(|_| invalid("malformed URL"))?;
    let transport = match uri.scheme_str() {
        Some("tcp") => Transport::Tcp,
        Some("udp") => Transport::Udp,
        _ => return Err(invalid("unsupported scheme")),
    };
    let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
    if authority.port_u16().is_none() {
        return Err(invalid("missing port"));
    }

    Ok((transport, authority.as_str().to_string()))
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

struct Destination {
    url: String,
    transport: Transport,
    addr: String,
    conn: Option<Connection>,
}

impl Destination {
    fn new(url: &str) -> io::Result<Self> {
        let (transport, addr) = parse_destination(url)?;
        Ok(Destination {
            url: url.to_string(),
            transport,
            addr,
            conn: None,
        })
    }

    async fn connect(&self) -> io::Result<Connection> {
        Ok(match self.transport {
            Transport::Tcp => Connection::Tcp(TcpStream::connect(&self.addr).await?),
            Transport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(&self.addr).await?;
                Connection::Udp(socket)
            }
        })
    }

    /// Sends one line, reconnecting first if needed; a failed send drops the
    /// connection.
    async fn send(&mut self, line: &[u8]) -> io::Result<()> {
        if self.conn.is_none() {
            self.conn = Some(self.connect().await?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        let res = match conn {
            Connection::Tcp(stream) => stream.write_all(line).await,
            Connection::Udp(socket) => socket.send(line).await.map(drop),
        };
        if res.is_err() {
            self.conn = None;
        }
        res
    }
}

/// Forwards kernel log records to every URL in [`KmsgLogConfig`].
///
/// Records are JSON objects, one per line over TCP or one per datagram
/// over UDP.
pub struct KmsgLogDeliveryController {
    follow: KmsgFollower,
    drainer: Drainer,
    address_ready: bool,
    urls: Vec<String>,
    destinations: Vec<Destination>,
}

impl std::fmt::Debug for KmsgLogDeliveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsgLogDeliveryController").field("urls", &self.urls).finish()
    }
}

impl KmsgLogDeliveryController {
    /// Delivers records produced by `follow`.
    pub fn new(follow: KmsgFollower, drainer: Drainer) -> Self {
        KmsgLogDeliveryController {
            follow,
            drainer,
            address_ready: false,
            urls: Vec::new(),
            destinations: Vec::new(),
        }
    }

    /// Re-reads the destinations; returns whether any are configured.
    pub fn refresh(&mut self, r: &ControllerRuntime) -> ControllerResult<bool> {
        if !self.address_ready {
            self.address_ready = r
                .get::<NetworkStatus>(NetworkStatus::ID)?
                .is_some_and(|status| status.spec.address_ready);
        }

        let urls = if self.address_ready {
            r.get::<KmsgLogConfig>(KmsgLogConfig::ID)?
                .map(|cfg| cfg.spec.destinations)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        if urls != self.urls {
            self.destinations = urls
                .iter()
                .filter_map(|url| match Destination::new(url) {
                    Ok(dest) => Some(dest),
                    Err(err) => {
                        warn!(error = %err, "ignoring kernel log destination");
                        None
                    }
                })
                .collect();
            if !urls.is_empty() {
                info!(destinations = ?urls, "kernel log delivery configured");
            }
            self.urls = urls;
        }

        Ok(!self.destinations.is_empty())
    }

    /// Sends one record to every destination.
    pub async fn deliver(&mut self, record: &KmsgRecord) -> ControllerResult {
        let datagram = serde_json::to_vec(&record.to_wire()).context("encoding kernel log record")?;
        let mut line = datagram.clone();
        line.push(b'\n');

        for dest in &mut self.destinations {
            let payload = match dest.transport {
                Transport::Tcp => &line,
                Transport::Udp => &datagram,
            };
            if let Err(err) = dest.send(payload).await {
                warn!(destination = %dest.url, error = %err, "failed to send kernel log record");
            }
        }

        Ok(())
    }

    async fn flush(&mut self, records: &mut mpsc::Receiver<KmsgRecord>) -> ControllerResult {
        while let Ok(Some(record)) = tokio::time::timeout(DRAIN_QUIET_PERIOD, records.recv()).await {
            self.deliver(&record).await?;
        }
        debug!("kernel log delivery drained");
        Ok(())
    }
}

async fn next_record(records: &mut Option<mpsc::Receiver<KmsgRecord>>) -> Option<KmsgRecord> {
    match records {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Controller for KmsgLogDeliveryController {
    fn name(&self) -> &str {
        "runtime.KmsgLogDeliveryController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<KmsgLogConfig>().with_id(KmsgLogConfig::ID),
            Input::weak::<NetworkStatus>().with_id(NetworkStatus::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut drain = self.drainer.subscribe();
        let mut records: Option<mpsc::Receiver<KmsgRecord>> = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                    if self.refresh(r)? && records.is_none() {
                        records = Some((self.follow)().context("following kernel log")?);
                    }
                }
                _ = drain.requested() => {
                    if let Some(rx) = records.as_mut() {
                        self.flush(rx).await?;
                    }
                    return Ok(());
                }
                record = next_record(&mut records), if records.is_some() => {
                    match record {
                        Some(record) => self.deliver(&record).await?,
                        None => {
                            warn!("kernel log reader stopped");
                            records = None;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::UNIX_EPOCH;

    use crate::testutil::{new_store, put};
    use keel_runtime::{DrainState, Runtime};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn record(seq: u64, raw_msg: &str) -> KmsgRecord {
        KmsgRecord::parse(&format!("6,{seq},1000,-;{raw_msg}"), UNIX_EPOCH).unwrap()
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            parse_destination("tcp://10.0.0.1:5044").unwrap(),
            (Transport::Tcp, "10.0.0.1:5044".to_string())
        );
        assert_eq!(parse_destination("udp://logs:514").unwrap().0, Transport::Udp);
        assert!(parse_destination("http://logs:80").is_err());
        assert!(parse_destination("tcp://logs").is_err());
    }

    #[tokio::test]
    async fn test_delivers_json_lines_and_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = mpsc::channel(16);
        let rx = parking_lot::Mutex::new(Some(rx));
        let follow: KmsgFollower = Arc::new(move || {
            rx.lock()
                .take()
                .ok_or_else(|| io::Error::other("already following"))
        });

        let store = new_store();
        let drainer = Drainer::new();
        let mut runtime = Runtime::new(store.clone());
        runtime
            .register(KmsgLogDeliveryController::new(follow, drainer.clone()))
            .unwrap();
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(ctx.clone()));

        put(
            &store,
            KmsgLogConfig::ID,
            KmsgLogConfig {
                destinations: vec![format!("tcp://{addr}")],
            },
        );
        put(
            &store,
            NetworkStatus::ID,
            NetworkStatus {
                address_ready: true,
                ..Default::default()
            },
        );

        tx.send(record(1, "first")).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();

        let first: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["msg"], "first");
        assert_eq!(first["level"], "info");
        assert_eq!(first["facility"], "kern");
        assert_eq!(first["seq"], 1);

        tx.send(record(2, "second")).await.unwrap();
        let second: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["msg"], "second");

        tx.send(record(3, "in flight")).await.unwrap();
        assert_eq!(drainer.drain(Duration::from_secs(5)).await, DrainState::Drained);
        let third: serde_json::Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(third["msg"], "in flight");

        ctx.cancel();
        handle.await.unwrap().unwrap();
    }
}
