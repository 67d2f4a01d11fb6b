use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use llmux_common::now_epoch_ms;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub timestamp: i64,
    pub chunk_size: usize,
}

/// One chunk of a value partitioned for streaming delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub id: String,
    pub data: Value,
    pub index: usize,
    pub total_chunks: usize,
    pub is_last: bool,
    pub metadata: ChunkMetadata,
}

impl ChunkEnvelope {
    /// Raw-encoded wrapper used when chunk encoding is enabled.
    pub fn encoded(&self) -> Value {
        serde_json::json!({
            "data": self.data,
            "encoding": "raw",
            "index": self.index,
            "total_chunks": self.total_chunks,
            "timestamp": self.metadata.timestamp,
        })
    }
}

/// Partitions a value: strings by characters, arrays by elements, objects by
/// keys. Scalars become a single chunk.
pub fn chunk_value(stream_id: &str, value: &Value, chunk_size: usize) -> Vec<ChunkEnvelope> {
    let chunk_size = chunk_size.max(1);
    let parts: Vec<Value> = match value {
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            chars
                .chunks(chunk_size)
                .map(|chunk| Value::String(chunk.iter().collect()))
                .collect()
        }
        Value::Array(items) => items
            .chunks(chunk_size)
            .map(|chunk| Value::Array(chunk.to_vec()))
            .collect(),
        Value::Object(map) => {
            let entries: Vec<(&String, &Value)> = map.iter().collect();
            entries
                .chunks(chunk_size)
                .map(|chunk| {
                    Value::Object(
                        chunk
                            .iter()
                            .map(|(key, value)| ((*key).clone(), (*value).clone()))
                            .collect::<Map<String, Value>>(),
                    )
                })
                .collect()
        }
        other => vec![other.clone()],
    };

    let total = parts.len().max(1);
    let parts = if parts.is_empty() {
        vec![value.clone()]
    } else {
        parts
    };
    parts
        .into_iter()
        .enumerate()
        .map(|(index, data)| ChunkEnvelope {
            id: format!("{stream_id}-{index}"),
            data,
            index,
            total_chunks: total,
            is_last: index + 1 == total,
            metadata: ChunkMetadata {
                timestamp: now_epoch_ms(),
                chunk_size,
            },
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamCombineError {
    MixedTypes,
    Empty,
}

impl std::fmt::Display for StreamCombineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamCombineError::MixedTypes => write!(f, "chunks are not of one combinable type"),
            StreamCombineError::Empty => write!(f, "no chunks to combine"),
        }
    }
}

impl std::error::Error for StreamCombineError {}

/// Stream-to-non-stream combination: string concat, array concat, or object
/// merge, decided by the first chunk's type.
pub fn combine_chunks(chunks: &[Value]) -> Result<Value, StreamCombineError> {
    let first = chunks.first().ok_or(StreamCombineError::Empty)?;
    match first {
        Value::String(_) => {
            let mut out = String::new();
            for chunk in chunks {
                out.push_str(chunk.as_str().ok_or(StreamCombineError::MixedTypes)?);
            }
            Ok(Value::String(out))
        }
        Value::Array(_) => {
            let mut out = Vec::new();
            for chunk in chunks {
                out.extend(
                    chunk
                        .as_array()
                        .ok_or(StreamCombineError::MixedTypes)?
                        .iter()
                        .cloned(),
                );
            }
            Ok(Value::Array(out))
        }
        Value::Object(_) => {
            let mut out = Map::new();
            for chunk in chunks {
                for (key, value) in chunk.as_object().ok_or(StreamCombineError::MixedTypes)? {
                    out.insert(key.clone(), value.clone());
                }
            }
            Ok(Value::Object(out))
        }
        only => {
            if chunks.len() == 1 {
                Ok(only.clone())
            } else {
                Err(StreamCombineError::MixedTypes)
            }
        }
    }
}

/// Emits envelopes through a bounded channel with optional inter-chunk
/// pacing. Send blocks when the consumer lags; a dropped receiver stops the
/// producer.
pub fn into_channel(
    envelopes: Vec<ChunkEnvelope>,
    delay: Option<Duration>,
) -> mpsc::Receiver<ChunkEnvelope> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for envelope in envelopes {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if tx.send(envelope).await.is_err() {
                return;
            }
        }
    });
    rx
}
