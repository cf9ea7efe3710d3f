//! Destination resolution for inbound tag reads.
//!
//! Readers publish `<identifier> Cabin <cabin>`; older firmware sends the bare
//! identifier. Everything here is pure: the same body always yields the same
//! identifier, cabin and routing key.

use std::str;

use crate::core::error::DecodeError;
use crate::core::message::InboundMessage;

/// Separator between identifier and cabin in an inbound body.
pub const CABIN_DELIMITER: &str = " Cabin ";

/// Cabin used when the body carries no delimiter.
pub const DEFAULT_CABIN: &str = "1";

/// Token joining the target name and the cabin in a routing key.
pub const CABIN_SEPARATOR: &str = ".cabin";

/// Decode `raw_body` and split it into identifier and cabin.
///
/// Splits at the first delimiter only; the identifier is kept verbatim and
/// only the cabin segment is trimmed.
pub fn resolve(raw_body: &[u8]) -> Result<InboundMessage, DecodeError> {
    let text = str::from_utf8(raw_body)?;

    let (identifier, cabin_id) = match text.split_once(CABIN_DELIMITER) {
        Some((identifier, cabin)) => (identifier, cabin.trim()),
        None => (text, DEFAULT_CABIN),
    };

    Ok(InboundMessage {
        raw_body: bytes::Bytes::copy_from_slice(raw_body),
        identifier: identifier.to_string(),
        cabin_id: cabin_id.to_string(),
    })
}

/// Routing key for `cabin` under `target`, e.g. `target_queue.cabin2`.
#[inline]
pub fn destination_topic(target: &str, cabin: &str) -> String {
    let mut topic = String::with_capacity(target.len() + CABIN_SEPARATOR.len() + cabin.len());
    topic.push_str(target);
    topic.push_str(CABIN_SEPARATOR);
    topic.push_str(cabin);
    topic
}

/// Binding pattern covering every cabin topic under `target`.
pub fn cabin_binding_pattern(target: &str) -> String {
    destination_topic(target, "*")
}
