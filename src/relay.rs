//! Streaming relay from a cluster line source to a connected client.
//!
//! A session moves `Connecting -> Streaming -> Closed`. Opening the source
//! happens before the relay starts; the relay only sees its result. A
//! failed open produces one diagnostic message and goes straight to
//! `Closed`. While streaming, every unit read from the source is sent as one
//! text message. The session ends on source EOF, on the first read error,
//! on a failed send, or when the client goes away. There is no reconnect or
//! replay.

use std::future::Future;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;

use crate::cluster::{ClusterError, LineStream};

/// Relay error types.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("client channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Streaming,
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The source could not be opened; one diagnostic was sent
    OpenFailed,
    SourceEnded,
    SourceError,
    /// The client disconnected or could no longer be written to
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub forwarded: usize,
    pub end: RelayEnd,
}

/// The client side of a session.
#[async_trait]
pub trait RelaySink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError>;

    /// Close the channel. Errors are ignored; the client may already be gone.
    async fn close(&mut self);
}

/// One relay session for a named source.
pub struct StreamSession<'a, K: RelaySink + ?Sized> {
    source: String,
    sink: &'a mut K,
    state: RelayState,
}

impl<'a, K: RelaySink + ?Sized> StreamSession<'a, K> {
    pub fn new(source: impl Into<String>, sink: &'a mut K) -> Self {
        Self {
            source: source.into(),
            sink,
            state: RelayState::Connecting,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition(&mut self, next: RelayState) {
        tracing::debug!(source = %self.source, from = ?self.state, to = ?next, "Relay state change");
        self.state = next;
    }

    /// Drive the session to `Closed`.
    ///
    /// `not_found` is the diagnostic sent when the source does not exist.
    /// `client_closed` resolves when the client disconnects; it is polled
    /// alongside every source read so a silent source can still be
    /// abandoned.
    pub async fn run<C>(
        mut self,
        opened: Result<LineStream, ClusterError>,
        not_found: &str,
        client_closed: C,
    ) -> RelaySummary
    where
        C: Future<Output = ()>,
    {
        let mut source = match opened {
            Ok(source) => source,
            Err(e) => {
                let diagnostic = match e {
                    ClusterError::NotFound(_) => not_found.to_string(),
                    other => format!("Failed to open stream: {}", other),
                };
                tracing::warn!(source = %self.source, message = %diagnostic, "Relay source unavailable");
                if let Err(e) = self.sink.send_text(diagnostic).await {
                    tracing::debug!(source = %self.source, error = %e, "Client gone before diagnostic");
                }
                self.sink.close().await;
                self.transition(RelayState::Closed);
                return RelaySummary {
                    forwarded: 0,
                    end: RelayEnd::OpenFailed,
                };
            }
        };

        self.transition(RelayState::Streaming);
        tokio::pin!(client_closed);

        let mut forwarded = 0;
        let end = loop {
            tokio::select! {
                biased;
                _ = &mut client_closed => {
                    break RelayEnd::ClientGone;
                }
                next = source.next() => {
                    match next {
                        Some(Ok(line)) => {
                            if let Err(e) = self.sink.send_text(line).await {
                                tracing::info!(source = %self.source, error = %e, "Client stopped accepting messages");
                                break RelayEnd::ClientGone;
                            }
                            forwarded += 1;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(source = %self.source, error = %e, "Relay source read failed");
                            break RelayEnd::SourceError;
                        }
                        None => break RelayEnd::SourceEnded,
                    }
                }
            }
        };

        // Release the source handle before waiting on the client.
        drop(source);
        self.sink.close().await;
        self.transition(RelayState::Closed);

        tracing::info!(source = %self.source, forwarded, end = ?end, "Relay session closed");
        RelaySummary { forwarded, end }
    }
}
