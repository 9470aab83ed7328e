//! Scripted upstream servers for tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Notify;

use crate::persistent::{read_framed, write_framed};

pub const ANSWER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

#[derive(Clone, Copy, Debug)]
pub enum UpstreamScript {
    /// Answer every query with one A record.
    Answer,
    /// Never answer.
    Silent,
    /// Send a reply with the wrong id first, then the real answer.
    MismatchFirst,
    /// Answer with a header claiming REFUSED followed by a chopped question.
    Garbled,
    /// Answer with a NOERROR reply for a different name.
    WrongQuestion,
    /// TCP only: answer one query, then close the connection.
    AnswerOnceThenClose,
    /// TCP only: answer one query, then abort the connection with an RST.
    AnswerOnceThenReset,
    /// Send every answer twice, as a retransmitting upstream would.
    AnswerThenDuplicate,
    /// Answer with enough A records to overflow a 512 byte UDP reply.
    Large,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<(u16, Option<Name>)>>>,
    /// Notified each time the TCP script closes a connection.
    pub closed: Arc<Notify>,
}

impl MockUpstream {
    /// Transaction ids as they arrived on the wire.
    pub fn seen_ids(&self) -> Vec<u16> {
        self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// First question name of every query, in arrival order.
    pub fn seen_names(&self) -> Vec<Option<Name>> {
        self.seen.lock().unwrap().iter().map(|(_, name)| name.clone()).collect()
    }
}

pub fn query(id: u16, name: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

pub fn answer(req: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    for q in req.queries() {
        msg.add_query(q.clone());
        msg.add_answer(Record::from_rdata(
            q.name().clone(),
            300,
            RData::A(A(ANSWER_IP)),
        ));
    }
    msg
}

fn record(seen: &Mutex<Vec<(u16, Option<Name>)>>, req: &Message) {
    let name = req.queries().first().map(|q| q.name().clone());
    seen.lock().unwrap().push((req.id(), name));
}

fn replies(script: UpstreamScript, req: &Message) -> Vec<Vec<u8>> {
    match script {
        UpstreamScript::Silent => Vec::new(),
        UpstreamScript::Answer
        | UpstreamScript::AnswerOnceThenClose
        | UpstreamScript::AnswerOnceThenReset => vec![answer(req).to_vec().unwrap()],
        UpstreamScript::AnswerThenDuplicate => {
            let buf = answer(req).to_vec().unwrap();
            vec![buf.clone(), buf]
        }
        UpstreamScript::MismatchFirst => {
            let mut stale = answer(req);
            stale.set_id(req.id().wrapping_add(1));
            vec![stale.to_vec().unwrap(), answer(req).to_vec().unwrap()]
        }
        UpstreamScript::Garbled => {
            let mut reply = answer(req);
            reply.set_response_code(ResponseCode::Refused);
            let mut buf = reply.to_vec().unwrap();
            buf.truncate(16);
            vec![buf]
        }
        UpstreamScript::Large => {
            let mut reply = answer(req);
            if let Some(q) = req.queries().first() {
                for i in 0..64u8 {
                    reply.add_answer(Record::from_rdata(
                        q.name().clone(),
                        300,
                        RData::A(A(Ipv4Addr::new(10, 0, 0, i))),
                    ));
                }
            }
            vec![reply.to_vec().unwrap()]
        }
        UpstreamScript::WrongQuestion => {
            let mut other = query(req.id(), "elsewhere.example.");
            other.set_message_type(MessageType::Response);
            vec![answer(&other).to_vec().unwrap()]
        }
    }
}

pub async fn udp_upstream(script: UpstreamScript) -> MockUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen_queries = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&seen_queries);
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(req) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            record(&seen, &req);
            for reply in replies(script, &req) {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    MockUpstream {
        addr,
        seen: seen_queries,
        closed: Arc::new(Notify::new()),
    }
}

pub async fn tcp_upstream(script: UpstreamScript) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_queries = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Notify::new());
    let seen = Arc::clone(&seen_queries);
    let notify = Arc::clone(&closed);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let seen = Arc::clone(&seen);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                while let Ok(buf) = read_framed(&mut stream).await {
                    let Ok(req) = Message::from_vec(&buf) else {
                        break;
                    };
                    record(&seen, &req);
                    for reply in replies(script, &req) {
                        if write_framed(&mut stream, &reply).await.is_err() {
                            break;
                        }
                    }
                    match script {
                        UpstreamScript::AnswerOnceThenClose => break,
                        UpstreamScript::AnswerOnceThenReset => {
                            // SO_LINGER 0: close sends RST instead of FIN
                            let _ = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO));
                            break;
                        }
                        _ => {}
                    }
                }
                drop(stream);
                notify.notify_one();
            });
        }
    });
    MockUpstream {
        addr,
        seen: seen_queries,
        closed,
    }
}
