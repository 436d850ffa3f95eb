//! Turning chunked API responses into line and event streams.

use std::fmt::Display;

use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::{ClusterError, EventMessage, LineStream};

/// Split a chunked byte stream into text lines without their terminators.
///
/// A trailing partial line is emitted when the stream ends. The first
/// transport error is yielded once and ends the stream.
pub fn split_lines<S, B, E>(chunks: S) -> LineStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    stream::unfold(
        (Box::pin(chunks), Vec::<u8>::new(), false),
        |(mut chunks, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (chunks, buf, done)));
                }

                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    return Some((Ok(text), (chunks, buf, done)));
                }

                match chunks.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        buf.clear();
                        let err = ClusterError::Transport(e.to_string());
                        return Some((Err(err), (chunks, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

#[derive(Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

/// Normalize one line of a watch response to an [`EventMessage`] document.
///
/// Watch `ERROR` entries carry a status object and end the stream as an
/// API error.
pub fn normalize_watch_line(line: &str) -> Result<String, ClusterError> {
    let event: WatchEvent =
        serde_json::from_str(line).map_err(|e| ClusterError::Decode(e.to_string()))?;

    if event.kind == "ERROR" {
        let status = event.object["code"].as_u64().unwrap_or(500) as u16;
        let message = event.object["message"]
            .as_str()
            .unwrap_or("watch error")
            .to_string();
        return Err(ClusterError::Api { status, message });
    }

    let normalized = EventMessage {
        name: event.object["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        message: event.object["message"].as_str().map(str::to_string),
    };
    serde_json::to_string(&normalized).map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Normalize every line of a watch stream, skipping blank keep-alive lines.
pub fn watch_events_from_lines(lines: LineStream) -> LineStream {
    lines
        .filter(|line| {
            let keep = !matches!(line, Ok(l) if l.trim().is_empty());
            async move { keep }
        })
        .map(|line| line.and_then(|l| normalize_watch_line(&l)))
        .boxed()
}
