use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;

use crate::persistent::{MIN_UDP_SIZE, Protocol};

/// 客户端可接收的最大响应大小 / Largest reply the client said it can take.
///
/// TCP clients get the full 64k; UDP clients get their EDNS payload size, or
/// 512 without EDNS.
pub fn client_size(msg: &Message, proto: Protocol) -> u16 {
    match proto {
        Protocol::Tcp | Protocol::TcpTls => u16::MAX,
        Protocol::Udp => msg.max_payload().max(MIN_UDP_SIZE),
    }
}

/// A fresh transaction id, never equal to `avoid`.
pub fn fresh_id(avoid: u16) -> u16 {
    loop {
        let id = fastrand::u16(..);
        if id != avoid {
            return id;
        }
    }
}

/// RCODE 的指标标签 / Metrics label for an rcode.
pub fn rcode_label(rcode: ResponseCode) -> String {
    match rcode {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        ResponseCode::YXDomain => "YXDOMAIN".to_string(),
        ResponseCode::YXRRSet => "YXRRSET".to_string(),
        ResponseCode::NXRRSet => "NXRRSET".to_string(),
        ResponseCode::NotAuth => "NOTAUTH".to_string(),
        ResponseCode::NotZone => "NOTZONE".to_string(),
        ResponseCode::BADVERS => "BADVERS".to_string(),
        other => u16::from(other).to_string(),
    }
}

/// Build an empty reply carrying `rcode` for `req`, echoing its question.
pub fn error_reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::error_msg(req.id(), req.op_code(), rcode);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    for q in req.queries() {
        msg.add_query(q.clone());
    }
    msg
}

/// Whether `reply` answers the question asked in `req` (type, class and
/// case-insensitive name of the first question).
pub fn matches_question(req: &Message, reply: &Message) -> bool {
    if reply.message_type() != MessageType::Response {
        return false;
    }
    match (req.queries().first(), reply.queries().first()) {
        (Some(q), Some(r)) => {
            // Name equality is case-insensitive.
            q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
                && q.name() == r.name()
        }
        // Some upstreams drop the question section on errors.
        (Some(_), None) => reply.response_code() != ResponseCode::NoError,
        (None, _) => true,
    }
}

/// Salvage the header of an undecodable reply so callers still see its id,
/// rcode and flags.
pub fn header_only(buf: &[u8]) -> Option<Message> {
    let header = Header::from_bytes(buf.get(..12)?).ok()?;
    let mut msg = Message::new();
    msg.set_id(header.id())
        .set_message_type(header.message_type())
        .set_op_code(header.op_code())
        .set_response_code(header.response_code())
        .set_truncated(header.truncated())
        .set_recursion_desired(header.recursion_desired())
        .set_recursion_available(header.recursion_available());
    Some(msg)
}

/// Shrink a UDP reply that exceeds the client's size: drop the record
/// sections and set TC so the client retries over TCP.
pub fn truncate_for_udp(msg: &mut Message) {
    msg.take_answers();
    msg.take_name_servers();
    msg.take_additionals();
    msg.set_truncated(true);
}
