// Result Streamer
//
// Newline delimited JSON in both directions. The streaming transport carries provenance
// as flat `_source_relay_uri_` / `_source_id_` columns, the polling transport nests it
// under `_relay_metadata_`.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::api::middleware::RelayError;
use crate::models::ResultRow;

/// Merged, provenance-tagged rows on their way to a caller
pub type RowStream = BoxStream<'static, Result<ResultRow, RelayError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    Streaming,
    Polling,
}

impl RowFormat {
    pub fn encode(&self, row: &ResultRow) -> Value {
        match self {
            RowFormat::Streaming => row.to_streaming_json(),
            RowFormat::Polling => row.to_polling_json(),
        }
    }

    pub fn decode(&self, value: Value) -> Result<ResultRow, RelayError> {
        match self {
            RowFormat::Streaming => ResultRow::from_streaming_json(value),
            RowFormat::Polling => ResultRow::from_polling_json(value),
        }
    }

    /// One row as a single NDJSON line, newline included
    pub fn encode_line(&self, row: &ResultRow) -> String {
        let mut line = self.encode(row).to_string();
        line.push('\n');
        line
    }

    fn decode_line(&self, line: &[u8]) -> Result<ResultRow, RelayError> {
        let value: Value = serde_json::from_slice(line)
            .map_err(|e| RelayError::Remote(format!("malformed result line: {}", e)))?;
        self.decode(value)
    }
}

/// Encode a row stream as NDJSON chunks, suitable for a streaming response body
pub fn ndjson_body(
    rows: RowStream,
    format: RowFormat,
) -> impl Stream<Item = Result<String, RelayError>> + Send + 'static {
    rows.map(move |row| row.map(|row| format.encode_line(&row)))
}

/// Encode rows already collected
pub fn encode_rows(rows: &[ResultRow], format: RowFormat) -> String {
    rows.iter().map(|row| format.encode_line(row)).collect()
}

/// Decode a complete NDJSON document, skipping blank lines
pub fn decode_rows(text: &str, format: RowFormat) -> Result<Vec<ResultRow>, RelayError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format.decode_line(line.as_bytes()))
        .collect()
}

/// Decode an NDJSON byte stream incrementally. Lines may span chunk boundaries.
pub fn decode_ndjson<S, B, E>(body: S, format: RowFormat) -> RowStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (body.boxed(), Vec::<u8>::new(), false);
    futures::stream::unfold(state, move |(mut body, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let row = format.decode_line(&line);
                return Some((row, (body, buffer, done)));
            }

            if done {
                if buffer.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buffer);
                return Some((format.decode_line(&line), (body, buffer, done)));
            }

            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buffer.clear();
                    done = true;
                    let err = RelayError::Remote(format!("result stream interrupted: {}", e));
                    return Some((Err(err), (body, buffer, done)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}
