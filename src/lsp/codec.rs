//! `Content-Length` framed JSON-RPC over a byte stream.
//!
//! Writing is a plain async call. Reading happens on a dedicated task that
//! feeds decoded frames into a bounded queue, so callers can wait on the
//! queue with a deadline and tell "nothing yet" apart from "stream closed"
//! and from a bad frame.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::lsp::protocol::Message;
use crate::lsp::transcript::Transcript;
use crate::utils::error::LspError;

/// Largest payload accepted from a server. Longer frames are rejected
/// before anything is allocated.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Frames held for the client between requests. Notifications arriving
/// while the queue is full are dropped; responses and server requests wait.
pub const INBOUND_CAPACITY: usize = 256;

/// One decoded frame together with its raw JSON body.
#[derive(Debug)]
pub struct Frame {
    pub body: String,
    pub message: Message,
}

/// Serialize `payload` as compact JSON, frame it and flush it.
///
/// Returns the JSON body so the caller can record it.
pub async fn write_message<W, T>(writer: &mut W, payload: &T) -> Result<String, LspError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_string(payload)?;
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(body)
}

/// Read exactly one frame. `Ok(None)` means the stream ended cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Frame>, LspError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            if saw_header {
                return Err(LspError::MalformedFrame("stream ended inside header".to_string()));
            }
            return Ok(None);
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;

        let Some((name, value)) = header.split_once(':') else {
            return Err(LspError::MalformedFrame(format!("bad header line: {header}")));
        };
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value.trim().parse().map_err(|_| {
                LspError::MalformedFrame(format!("bad Content-Length: {}", value.trim()))
            })?;
            content_length = Some(len);
        }
    }

    let len = content_length.ok_or(LspError::MissingHeader)?;
    if len > MAX_FRAME_BYTES {
        return Err(LspError::MalformedFrame(format!(
            "Content-Length {len} exceeds limit of {MAX_FRAME_BYTES} bytes"
        )));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    let body = String::from_utf8(payload)
        .map_err(|e| LspError::MalformedFrame(format!("payload is not UTF-8: {e}")))?;
    let message = serde_json::from_str(&body)?;

    Ok(Some(Frame { body, message }))
}

/// Result of waiting on the inbound queue.
#[derive(Debug)]
pub enum ReadOutcome {
    Message(Message),
    /// Nothing arrived within the wait.
    NotYet,
    /// The reader stopped: EOF, read failure or cancellation.
    Closed,
}

/// Receiving end of the reader task.
pub struct Incoming {
    rx: mpsc::Receiver<Result<Message, LspError>>,
    stopped: CancellationToken,
}

impl Incoming {
    /// Cancelled once the reader task has exited, for whatever reason.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    pub async fn next_within(&mut self, wait: Duration) -> Result<ReadOutcome, LspError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => Ok(ReadOutcome::NotYet),
            Ok(None) => Ok(ReadOutcome::Closed),
            Ok(Some(Ok(message))) => Ok(ReadOutcome::Message(message)),
            Ok(Some(Err(err))) => Err(err),
        }
    }

    /// Non-waiting variant of [`Incoming::next_within`].
    pub fn try_next(&mut self) -> Result<ReadOutcome, LspError> {
        match self.rx.try_recv() {
            Ok(Ok(message)) => Ok(ReadOutcome::Message(message)),
            Ok(Err(err)) => Err(err),
            Err(TryRecvError::Empty) => Ok(ReadOutcome::NotYet),
            Err(TryRecvError::Disconnected) => Ok(ReadOutcome::Closed),
        }
    }
}

/// Start the task that decodes frames from `reader` until EOF or cancellation.
///
/// Every decoded payload is recorded in `transcript`. Malformed frames are
/// forwarded as errors and reading continues; I/O errors end the task.
pub fn spawn_reader<R>(
    reader: R,
    transcript: Arc<Transcript>,
    cancel: CancellationToken,
) -> Incoming
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let stopped = CancellationToken::new();
    let on_exit = stopped.clone().drop_guard();

    tokio::spawn(async move {
        let _on_exit = on_exit;
        let mut reader = reader;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = read_message(&mut reader) => next,
            };

            let item = match next {
                Ok(Some(frame)) => {
                    transcript.record("RAW PAYLOAD", &frame.body);
                    Ok(frame.message)
                }
                Ok(None) => {
                    tracing::debug!("LSP server stdout closed (EOF)");
                    break;
                }
                Err(LspError::Io(err)) => {
                    tracing::debug!("LSP server stdout read error: {err}");
                    let _ = tx.try_send(Err(LspError::Io(err)));
                    break;
                }
                Err(err) => {
                    tracing::warn!("Malformed LSP frame: {err}");
                    transcript.record("MALFORMED", &err.to_string());
                    Err(err)
                }
            };

            if !forward(&tx, item, &transcript, &cancel).await {
                break;
            }
        }
    });

    Incoming { rx, stopped }
}

/// Queue one item. Returns false once the receiver is gone or the reader
/// is cancelled.
async fn forward(
    tx: &mpsc::Sender<Result<Message, LspError>>,
    item: Result<Message, LspError>,
    transcript: &Transcript,
    cancel: &CancellationToken,
) -> bool {
    let droppable = item.as_ref().map_or(true, Message::is_notification);
    if !droppable {
        return tokio::select! {
            () = cancel.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        };
    }

    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(Ok(message))) => {
            let method = message.method.as_deref().unwrap_or_default();
            tracing::debug!("Inbound queue full, dropping notification {method}");
            transcript.record("DROPPED", method);
            true
        }
        Err(TrySendError::Full(Err(err))) => {
            tracing::debug!("Inbound queue full, dropping error: {err}");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
