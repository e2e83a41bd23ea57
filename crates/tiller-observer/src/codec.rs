//! NDJSON event framing.
//!
//! One JSON-encoded event per line.  The decoder is lenient: blank lines
//! and lines that fail to decode (unknown event types included) are
//! skipped with a warning, never a stream failure.

use std::io::{BufRead, Write};

use tracing::warn;

use tiller_core::Event;

use crate::error::Result;

/// Encode one event as a single JSON line, without the newline.
pub fn encode_line(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode one line.
pub fn decode_line(line: &str) -> Result<Event> {
    Ok(serde_json::from_str(line)?)
}

/// Write a stream of events as NDJSON.
pub fn write_stream<W: Write>(writer: &mut W, events: &[Event]) -> Result<()> {
    for event in events {
        writeln!(writer, "{}", encode_line(event)?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every decodable event from an NDJSON reader, skipping blank and
/// malformed lines.
pub fn read_stream<R: BufRead>(reader: R) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match decode_line(trimmed) {
            Ok(event) => events.push(event),
            Err(err) => {
                warn!(line = number + 1, error = %err, "skipping undecodable event line");
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tiller_core::{Actor, EventKind, EventLevel};
    use uuid::Uuid;

    fn sample(seq: u64) -> Event {
        Event {
            id: Uuid::now_v7(),
            seq,
            ts: Utc::now(),
            run_id: Uuid::nil(),
            trace_id: Uuid::nil(),
            span_id: None,
            parent_span_id: None,
            actor: Actor::orchestrator(),
            level: EventLevel::Info,
            candidate_id: None,
            message: "test".to_string(),
            kind: EventKind::Heartbeat,
        }
    }

    #[test]
    fn round_trip_through_ndjson() {
        let events = vec![sample(1), sample(2)];
        let mut buffer = Vec::new();
        write_stream(&mut buffer, &events).unwrap();
        let decoded = read_stream(buffer.as_slice()).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        let good = encode_line(&sample(1)).unwrap();
        let input = format!("\n{good}\nnot json\n{{\"eventType\":\"totally.new\"}}\n");
        let decoded = read_stream(input.as_bytes()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].seq, 1);
    }
}
