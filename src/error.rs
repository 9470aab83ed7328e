use std::io;
use std::net::SocketAddr;

use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use thiserror::Error;

use crate::persistent::Protocol;

/// 单个连接上的读写错误 / Read or write failure on a single upstream connection.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("{0}")]
    Io(#[from] io::Error),
    /// The bytes arrived but did not decode. `partial` holds whatever the
    /// header still told us (id, rcode, flags).
    #[error("codec: {source}")]
    Codec {
        #[source]
        source: ProtoError,
        partial: Option<Box<Message>>,
    },
}

impl ConnError {
    /// Whether the peer closed the socket under us. On a pooled connection this
    /// means the upstream reaped an idle connection, not that it is down.
    pub fn is_closed(&self) -> bool {
        match self {
            ConnError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            ConnError::Codec { .. } => false,
        }
    }

    pub fn partial(&self) -> Option<&Message> {
        match self {
            ConnError::Codec { partial, .. } => partial.as_deref(),
            ConnError::Io(_) => None,
        }
    }

    pub(crate) fn restore_id(&mut self, id: u16) {
        if let ConnError::Codec {
            partial: Some(msg), ..
        } = self
        {
            msg.set_id(id);
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("dial {proto} {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        proto: Protocol,
        #[source]
        source: io::Error,
    },
    #[error("upstream {0} is marked unhealthy")]
    Unhealthy(SocketAddr),
    /// A reused connection turned out to be closed by the upstream. Safe to
    /// retry on a fresh connection right away.
    #[error("cached connection was closed by peer")]
    CachedClosed,
    #[error("write to {addr}: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: ConnError,
    },
    #[error("read from {addr}: {source}")]
    Read {
        addr: SocketAddr,
        #[source]
        source: ConnError,
    },
    #[error("transport for {0} has shut down")]
    TransportClosed(SocketAddr),
    #[error("no healthy upstream")]
    NoHealthyUpstream,
}

impl ForwardError {
    /// Header-only reply salvaged from an undecodable upstream answer, with the
    /// client's original id already restored.
    pub fn partial_reply(&self) -> Option<&Message> {
        match self {
            ForwardError::Read { source, .. } => source.partial(),
            _ => None,
        }
    }
}
