//! DNS messages of the tunnel: one-question TXT queries and their answers.
//!
//! Message encoding and decoding is left to `hickory-proto`; this module
//! only decides which fields the tunnel reads and sets.

use hickory_proto::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

use crate::error::{Result, TunnelError};

/// Longest character-string inside a TXT record.
const MAX_TXT_STRING: usize = 255;

fn dns_error(e: ProtoError) -> TunnelError {
    TunnelError::Dns(e.to_string())
}

/// Build a recursive TXT query for `name`.
pub fn encode_query(id: u16, name: &str) -> Result<Vec<u8>> {
    let name = Name::from_ascii(name).map_err(dns_error)?;
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::TXT));
    message.to_vec().map_err(dns_error)
}

/// Decode a query. Responses and queries without a question are errors.
pub fn parse_query(msg: &[u8]) -> Result<Message> {
    let message = Message::from_vec(msg).map_err(dns_error)?;
    if message.message_type() != MessageType::Query {
        return Err(TunnelError::Dns("not a query".into()));
    }
    if message.queries().is_empty() {
        return Err(TunnelError::Dns("query without question".into()));
    }
    Ok(message)
}

/// Labels of a name, most specific first.
pub fn labels(name: &Name) -> Vec<String> {
    name.iter()
        .map(|label| String::from_utf8_lossy(label).into_owned())
        .collect()
}

/// Build the answer to `request`, carrying `text` as a TXT record on its
/// first question when given.
pub fn encode_response(request: &Message, text: Option<&str>) -> Result<Vec<u8>> {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_authoritative(true)
        .set_recursion_desired(request.recursion_desired());

    if let Some(question) = request.queries().first() {
        response.add_query(question.clone());
        if let Some(text) = text {
            // base32 text is ASCII, so byte chunks are char boundaries
            let strings = text
                .as_bytes()
                .chunks(MAX_TXT_STRING)
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect::<Vec<_>>();
            let strings = if strings.is_empty() {
                vec![String::new()]
            } else {
                strings
            };
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                0,
                RData::TXT(TXT::new(strings)),
            ));
        }
    }
    response.to_vec().map_err(dns_error)
}

/// Parse a response: returns its id and the concatenated strings of the
/// first TXT answer, if any.
pub fn parse_response(msg: &[u8]) -> Result<(u16, Option<Vec<u8>>)> {
    let message = Message::from_vec(msg).map_err(dns_error)?;
    if message.message_type() != MessageType::Response {
        return Err(TunnelError::Dns("not a response".into()));
    }

    let text = message.answers().iter().find_map(|record| match record.data() {
        RData::TXT(txt) => Some(txt.txt_data().concat()),
        _ => None,
    });
    Ok((message.id(), text))
}
