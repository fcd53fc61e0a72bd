//! Envelope framing over byte streams
//!
//! Frames are length-delimited (4-byte big-endian length prefix) JSON
//! envelopes. The same framing is used on both ends of a module's
//! stdin/stdout pair.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::module::ipc::protocol::Envelope;

/// Largest accepted frame
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Reads envelopes, silently skipping frames that fail to decode
pub struct EnvelopeReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
    label: String,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
            label: label.into(),
        }
    }

    /// Next well-formed envelope, or `None` once the stream ends
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            match self.inner.next().await? {
                Ok(frame) => match Envelope::decode(&frame) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => debug!("Dropping malformed envelope from {}: {}", self.label, e),
                },
                Err(e) => {
                    warn!("Channel from {} failed: {}", self.label, e);
                    return None;
                }
            }
        }
    }
}

/// Spawn the task that owns the write half, draining `rx` onto it
///
/// The task ends when every sender is dropped or the stream breaks.
pub fn spawn_writer<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    label: impl Into<String>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let label = label.into();
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, codec());
        while let Some(envelope) = rx.recv().await {
            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode {} for {}: {}", envelope.kind(), label, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(frame).await {
                warn!("Failed to write to {}: {}", label, e);
                break;
            }
        }
        debug!("Writer for {} stopped", label);
    })
}
