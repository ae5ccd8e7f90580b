//! Self-delimited streaming events.
//!
//! Each event is one `data: {json}\n\n` frame. A stream that ends without a
//! `done` frame was cut short and must be treated as failed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use maskwork_core::{Error, ImageId, Result, TemplateId};
use maskwork_eye::BatchRecord;
use serde::{Deserialize, Serialize};

const FRAME_PREFIX: &str = "data:";
const FRAME_END: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Item {
        index: usize,
        image_id: ImageId,
        filename: String,
        /// Base64 PNG of the edited image
        variant_png: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mask_png: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        applied: Vec<TemplateId>,
    },
    Error {
        index: usize,
        image_id: ImageId,
        filename: String,
        error: String,
    },
    Done {
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl BatchEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, BatchEvent::Done { .. })
    }

    /// Decoded PNG bytes of an item event
    pub fn variant_bytes(&self) -> Option<Result<Vec<u8>>> {
        match self {
            BatchEvent::Item { variant_png, .. } => Some(
                BASE64
                    .decode(variant_png)
                    .map_err(|e| Error::Serialization(format!("invalid variant_png: {}", e))),
            ),
            _ => None,
        }
    }
}

impl From<BatchRecord> for BatchEvent {
    fn from(record: BatchRecord) -> Self {
        match record {
            BatchRecord::Success(item) => BatchEvent::Item {
                index: item.index,
                image_id: item.image_id,
                filename: item.filename,
                variant_png: BASE64.encode(&item.image_png),
                mask_png: item.mask_png.map(|m| BASE64.encode(m)),
                score: item.score,
                applied: item.applied,
            },
            BatchRecord::Failure(failure) => BatchEvent::Error {
                index: failure.index,
                image_id: failure.image_id,
                filename: failure.filename,
                error: failure.error,
            },
            BatchRecord::Done(summary) => BatchEvent::Done {
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
            },
        }
    }
}

pub fn encode_event(event: &BatchEvent) -> Result<String> {
    Ok(format!("{} {}{}", FRAME_PREFIX, serde_json::to_string(event)?, FRAME_END))
}

/// Incremental frame parser; tolerates frames split across reads.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: String,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete event it finished
    pub fn push(&mut self, chunk: &str) -> Result<Vec<BatchEvent>> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find(FRAME_END) {
            let frame: String = self.buffer.drain(..end + FRAME_END.len()).collect();
            for line in frame.lines() {
                if let Some(payload) = line.strip_prefix(FRAME_PREFIX) {
                    events.push(serde_json::from_str(payload.trim())?);
                }
            }
        }
        Ok(events)
    }

    /// Bytes received after the last complete frame
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

pub fn decode_events(text: &str) -> Result<Vec<BatchEvent>> {
    EventDecoder::new().push(text)
}

/// What a consumer saw on one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub items: usize,
    pub errors: usize,
    pub completed: bool,
}

impl StreamOutcome {
    pub fn observe(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::Item { .. } => self.items += 1,
            BatchEvent::Error { .. } => self.errors += 1,
            BatchEvent::Done { .. } => self.completed = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize) -> BatchEvent {
        BatchEvent::Item {
            index,
            image_id: ImageId::from("img"),
            filename: "a.png".to_string(),
            variant_png: BASE64.encode(b"png"),
            mask_png: None,
            score: Some(0.5),
            applied: vec![],
        }
    }

    #[test]
    fn test_frame_format() {
        let frame = encode_event(&BatchEvent::Done { total: 1, succeeded: 1, failed: 0 }).unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains(r#""type":"done""#));
    }

    #[test]
    fn test_decoder_handles_split_frames() {
        let text = [item(0), item(1), BatchEvent::Done { total: 2, succeeded: 2, failed: 0 }]
            .iter()
            .map(|e| encode_event(e).unwrap())
            .collect::<String>();
        let (head, tail) = text.split_at(text.len() / 2);

        let mut decoder = EventDecoder::new();
        let mut events = decoder.push(head).unwrap();
        assert!(!decoder.pending().is_empty());
        events.extend(decoder.push(tail).unwrap());
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], item(1));
        assert!(events[2].is_done());
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_outcome_without_done_is_incomplete() {
        let mut outcome = StreamOutcome::default();
        outcome.observe(&item(0));
        outcome.observe(&BatchEvent::Error {
            index: 1,
            image_id: ImageId::from("b"),
            filename: "b.png".into(),
            error: "boom".into(),
        });
        assert_eq!((outcome.items, outcome.errors, outcome.completed), (1, 1, false));
        outcome.observe(&BatchEvent::Done { total: 2, succeeded: 1, failed: 1 });
        assert!(outcome.completed);
    }

    #[test]
    fn test_variant_bytes() {
        assert_eq!(item(0).variant_bytes().unwrap().unwrap(), b"png".to_vec());
        assert!(BatchEvent::Done { total: 0, succeeded: 0, failed: 0 }.variant_bytes().is_none());
    }
}
