//! `text/event-stream` framing for the Parley event vocabulary.
//!
//! Line buffering, field parsing and UTF-8 reassembly are done by
//! `eventsource-stream`; this module maps the resulting frames onto
//! [`StreamEvent`]s and drops anything outside the vocabulary.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::events::StreamEvent;

/// Comment frame written by the gateway to keep idle connections open.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Comment line written while a frame is partially forwarded. Legal inside a
/// frame and ignored by every parser.
pub const HEARTBEAT_LINE: &str = ": heartbeat\n";

/// Name given to frames without an `event:` field.
const DEFAULT_EVENT_NAME: &str = "message";

/// Decode one frame.
///
/// Unnamed frames take their event name from the payload's `type` field.
/// Returns `None` for frames outside the vocabulary and malformed payloads.
pub fn decode_frame(event: &str, data: &str) -> Option<StreamEvent> {
    if event.is_empty() || event == DEFAULT_EVENT_NAME {
        let Some(name) = type_from_payload(data) else {
            log::debug!("dropping unnamed frame: {data}");
            return None;
        };
        return StreamEvent::decode(&name, data);
    }
    StreamEvent::decode(event, data)
}

/// Decode a raw byte stream into events.
///
/// Chunk boundaries do not matter. Dropped frames are skipped; transport
/// and framing failures are passed through.
pub fn decode_events<S, B, E>(
    stream: S,
) -> impl Stream<Item = Result<StreamEvent, EventStreamError<E>>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream.eventsource().filter_map(|item| async move {
        match item {
            Ok(frame) => decode_frame(&frame.event, &frame.data).map(Ok),
            Err(err) => Some(Err(err)),
        }
    })
}

fn type_from_payload(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
