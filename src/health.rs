//! In-band health checking of upstreams.
//!
//! A prober sleeps until a forwarding error asks for a probe, then sends
//! `. IN NS` over a fresh connection every interval until the upstream
//! answers. Failures are counted on the proxy, which flags its transport
//! down after too many in a row.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ForwardError;
use crate::persistent::{PersistConn, Protocol};
use crate::proxy::Proxy;
use crate::transport::MIN_DIAL_TIMEOUT;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_FAILS: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct HealthCheck {
    pub interval: Duration,
    pub max_fails: u32,
    /// Protocol of the probe; TLS upstreams always probe over `tcp-tls`.
    pub proto: Protocol,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_fails: DEFAULT_MAX_FAILS,
            proto: Protocol::Udp,
        }
    }
}

fn probe_query() -> Message {
    let mut msg = Message::new();
    msg.set_id(fastrand::u16(..))
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    msg.add_query(Query::query(Name::root(), RecordType::NS));
    msg
}

/// Send one probe. Any reply with the probe's id counts, whatever its rcode.
pub async fn probe(proxy: &Proxy, proto: Protocol) -> Result<(), ForwardError> {
    let transport = proxy.transport();
    let addr = proxy.addr();
    let proto = transport.resolve_protocol(proto);

    let mut pc = PersistConn::dial(addr, proto, transport.tls(), MIN_DIAL_TIMEOUT)
        .await
        .map_err(|source| ForwardError::Dial {
            addr,
            proto,
            source,
        })?;

    let query = probe_query();
    pc.set_write_deadline(Instant::now() + proxy.read_timeout());
    pc.write_msg(&query)
        .await
        .map_err(|source| ForwardError::Write { addr, source })?;

    pc.set_read_deadline(Instant::now() + proxy.read_timeout());
    loop {
        let reply = pc
            .read_msg()
            .await
            .map_err(|source| ForwardError::Read { addr, source })?;
        if reply.id() == query.id() {
            return Ok(());
        }
    }
}

/// Spawn the prober for `proxy`. It exits when the proxy's transport stops.
pub fn spawn(proxy: Arc<Proxy>, hc: HealthCheck) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stopped = proxy.transport().stopped();
        'idle: loop {
            if *stopped.borrow() {
                break;
            }
            tokio::select! {
                _ = proxy.probe_requested() => {}
                _ = stopped.changed() => break 'idle,
            }

            loop {
                match probe(&proxy, hc.proto).await {
                    Ok(()) => {
                        debug!(upstream = %proxy.addr(), "health check ok");
                        proxy.record_success();
                        continue 'idle;
                    }
                    Err(err) => {
                        warn!(upstream = %proxy.addr(), error = %err, fails = proxy.fails() + 1, "health check failed");
                        proxy.metrics().healthcheck_failure(proxy.addr());
                        proxy.record_failure(hc.max_fails);
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(hc.interval) => {}
                    _ = stopped.changed() => break 'idle,
                }
            }
        }
        debug!(upstream = %proxy.addr(), "health checker stopped");
    })
}
