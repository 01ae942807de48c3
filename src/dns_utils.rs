use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

/// 为请求构造一个应答骨架（复制 ID、问题、RD 位） / Reply skeleton for `req` with the given rcode.
pub fn build_reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    msg
}

/// Diagnostic TXT record put in the additional section of synthetic replies.
pub fn diagnostic_txt(label: &str, text: String) -> Record {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let name = Name::from_str(&format!("{}.{}.seqdns.", millis, label)).unwrap_or_else(|_| Name::root());
    let mut record = Record::from_rdata(name, 0, RData::TXT(TXT::new(vec![text])));
    record.set_dns_class(DNSClass::IN);
    record
}

/// 应答与权威区记录中的最小 TTL / Minimal TTL over answer and authority records.
pub fn min_ttl(msg: &Message) -> Option<u32> {
    msg.answers()
        .iter()
        .chain(msg.name_servers().iter())
        .map(Record::ttl)
        .min()
}

fn map_ttl(msg: &mut Message, f: impl Fn(u32) -> u32) {
    let answers = msg.take_answers();
    let name_servers = msg.take_name_servers();
    let additionals = msg.take_additionals();
    let fix = |mut records: Vec<Record>| {
        for r in &mut records {
            r.set_ttl(f(r.ttl()));
        }
        records
    };
    msg.insert_answers(fix(answers));
    msg.insert_name_servers(fix(name_servers));
    msg.insert_additionals(fix(additionals));
}

pub fn subtract_ttl(msg: &mut Message, delta: u32) {
    map_ttl(msg, |ttl| ttl.saturating_sub(delta).max(1));
}

pub fn set_ttl(msg: &mut Message, ttl: u32) {
    map_ttl(msg, |_| ttl);
}

pub fn answer_has_type(msg: &Message, rtype: RecordType) -> bool {
    msg.answers().iter().any(|r| r.record_type() == rtype)
}

/// 读取报文中的事务 ID / Transaction id of a wire message.
#[inline]
pub fn wire_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

#[inline]
pub fn set_wire_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn parse_rcode(rcode: &str) -> Option<ResponseCode> {
    if let Ok(n) = rcode.parse::<u16>() {
        if n > 0xFFF {
            return None;
        }
        return Some(ResponseCode::from((n >> 4) as u8, (n & 0x0F) as u8));
    }
    match rcode.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(ResponseCode::NoError),
        "FORMERR" => Some(ResponseCode::FormErr),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "NOTIMP" => Some(ResponseCode::NotImp),
        "REFUSED" => Some(ResponseCode::Refused),
        _ => None,
    }
}

pub fn parse_record_type(s: &str) -> Option<RecordType> {
    match s.parse::<u16>() {
        Ok(n) => Some(RecordType::from(n)),
        Err(_) => RecordType::from_str(&s.to_ascii_uppercase()).ok(),
    }
}

pub fn parse_dns_class(s: &str) -> Option<DNSClass> {
    match s.parse::<u16>() {
        Ok(n) => Some(DNSClass::from(n)),
        Err(_) => DNSClass::from_str(&s.to_ascii_uppercase()).ok(),
    }
}
