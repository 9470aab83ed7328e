//! Per-upstream connection broker.
//!
//! A single task owns the idle connection cache for one upstream. Callers
//! lease a connection with [`Transport::dial`] and hand it back with
//! [`Transport::yield_conn`]; both are messages on one FIFO command channel,
//! so the cache is never touched by two tasks at once and a connection is
//! never leased twice.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::ForwardError;
use crate::metrics::MetricsSink;
use crate::persistent::{PersistConn, Protocol};
use crate::tls::TlsSettings;

pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
const CUMULATIVE_AVG_WEIGHT: i64 = 4;
const COMMAND_QUEUE: usize = 1024;

/// Timeout to use next: twice the observed average, kept within `[min, max]`.
pub fn limit_timeout(avg: &AtomicI64, min: Duration, max: Duration) -> Duration {
    let rt = Duration::from_nanos(avg.load(Ordering::Relaxed).max(0) as u64);
    if rt < min {
        return min;
    }
    if rt < max / 2 {
        return 2 * rt;
    }
    max
}

/// Move the average towards `observed` by `1/weight` of the gap.
pub fn average_timeout(avg: &AtomicI64, observed: Duration, weight: i64) {
    let dt = avg.load(Ordering::Relaxed);
    let observed = i64::try_from(observed.as_nanos()).unwrap_or(i64::MAX);
    avg.fetch_add((observed - dt) / weight, Ordering::Relaxed);
}

enum Command {
    Dial {
        proto: Protocol,
        reply: oneshot::Sender<Option<PersistConn>>,
    },
    Yield(PersistConn),
}

pub struct Transport {
    addr: SocketAddr,
    avg_dial_time: AtomicI64,
    tls: Option<TlsSettings>,
    healthy: AtomicBool,
    cmd_tx: mpsc::Sender<Command>,
    stop_tx: watch::Sender<bool>,
    metrics: Arc<dyn MetricsSink>,
}

impl Transport {
    /// Create the transport and spawn its broker. Must run inside a tokio
    /// runtime.
    pub fn new(
        addr: SocketAddr,
        tls: Option<TlsSettings>,
        expire: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let expire = expire.max(Duration::from_millis(1));
        tokio::spawn(run_broker(addr, expire, cmd_rx, stop_rx));
        Self {
            addr,
            avg_dial_time: AtomicI64::new(0),
            tls,
            healthy: AtomicBool::new(true),
            cmd_tx,
            stop_tx,
            metrics,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// The protocol a dial for `proto` actually uses: TLS wins when configured.
    pub fn resolve_protocol(&self, proto: Protocol) -> Protocol {
        if self.tls.is_some() {
            Protocol::TcpTls
        } else {
            proto
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn avg_dial_time(&self) -> Duration {
        Duration::from_nanos(self.avg_dial_time.load(Ordering::Relaxed).max(0) as u64)
    }

    pub fn dial_timeout(&self) -> Duration {
        limit_timeout(&self.avg_dial_time, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT)
    }

    fn update_dial_timeout(&self, dial_time: Duration) {
        average_timeout(&self.avg_dial_time, dial_time, CUMULATIVE_AVG_WEIGHT);
    }

    /// Lease a connection for `proto`. Returns `(conn, true)` for a cached
    /// connection, `(conn, false)` for a fresh dial.
    pub async fn dial(&self, proto: Protocol) -> Result<(PersistConn, bool), ForwardError> {
        let proto = self.resolve_protocol(proto);
        if !self.is_healthy() {
            return Err(ForwardError::Unhealthy(self.addr));
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dial { proto, reply })
            .await
            .map_err(|_| ForwardError::TransportClosed(self.addr))?;
        let cached = rx
            .await
            .map_err(|_| ForwardError::TransportClosed(self.addr))?;

        if let Some(pc) = cached {
            self.metrics.conn_cache_hit(self.addr, proto);
            return Ok((pc, true));
        }
        self.metrics.conn_cache_miss(self.addr, proto);

        let start = Instant::now();
        let timeout = self.dial_timeout();
        let res = PersistConn::dial(self.addr, proto, self.tls.as_ref(), timeout).await;
        self.update_dial_timeout(start.elapsed());
        let pc = res.map_err(|source| ForwardError::Dial {
            addr: self.addr,
            proto,
            source,
        })?;
        debug!(
            upstream = %self.addr,
            proto = %proto,
            timeout_ms = timeout.as_millis() as u64,
            avg_dial_ms = self.avg_dial_time().as_millis() as u64,
            "dialed new upstream connection"
        );
        Ok((pc, false))
    }

    /// Return a connection for reuse. Never blocks; if the broker is gone or
    /// backed up the connection is simply closed.
    pub fn yield_conn(&self, pc: PersistConn) {
        if let Err(err) = self.cmd_tx.try_send(Command::Yield(pc)) {
            trace!(upstream = %self.addr, error = %err, "connection not returned to cache");
        }
    }

    /// Stop the broker; cached connections are closed and later dials fail
    /// with `TransportClosed`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_broker(
    addr: SocketAddr,
    expire: Duration,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut stop_rx: watch::Receiver<bool>,
) {
    // 每种协议最多缓存一个空闲连接
    let mut conns: FxHashMap<Protocol, PersistConn> = FxHashMap::default();
    let mut ticker = tokio::time::interval(expire);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Dial { proto, reply }) => {
                    let pc = conns.remove(&proto).filter(|pc| pc.idle_for() < expire);
                    // Caller gave up waiting: keep the connection for the next one.
                    if let Err(Some(pc)) = reply.send(pc) {
                        conns.insert(proto, pc);
                    }
                }
                Some(Command::Yield(mut pc)) => {
                    pc.touch();
                    if let Some(old) = conns.insert(pc.protocol(), pc) {
                        trace!(upstream = %addr, proto = %old.protocol(), "replaced cached connection");
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                conns.retain(|_, pc| pc.idle_for() < expire);
            }
            res = stop_rx.changed() => {
                if res.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(upstream = %addr, cached = conns.len(), "transport broker stopped");
}
