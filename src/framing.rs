//! Batch framing
//!
//! A single WebSocket text frame may carry several envelopes separated by
//! `\n`. JSON escapes newlines inside strings, so a record never contains a
//! raw separator.

use std::borrow::Borrow;

use crate::message::Message;

/// Separator between records in one frame
pub const RECORD_SEPARATOR: char = '\n';

/// Join several envelopes into one frame
pub fn encode_batch<M: Borrow<Message>>(messages: &[M]) -> Result<String, serde_json::Error> {
    let mut frame = String::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            frame.push(RECORD_SEPARATOR);
        }
        frame.push_str(&serde_json::to_string(message.borrow())?);
    }
    Ok(frame)
}

/// Split a frame into its non-blank records
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// Decode every record in a frame independently
///
/// One bad record does not prevent decoding the others.
pub fn decode_batch(frame: &str) -> Vec<Result<Message, serde_json::Error>> {
    split_records(frame).map(serde_json::from_str).collect()
}
