//! Streaming HTTP response bodies written by the dispatcher.
//!
//! [`channel`] pairs a [`BodySender`], which the registry holds like any other
//! [`Transport`], with the [`Body`] handed back to the HTTP server. Writes are queued as
//! chunks on a bounded channel; when the connection drains slower than the dispatcher
//! writes, writes wait, and the client's write timeout applies as it would on a socket.

use axum::body::{Body, Bytes};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

use crate::registry::Transport;

/// Chunks buffered between the dispatcher and the connection. One part takes three.
pub const BODY_BUFFER_CHUNKS: usize = 6;

/// Writing end of a streaming response body.
pub struct BodySender {
    chunks: PollSender<Bytes>,
}

/// Create a body and the sender that feeds it.
pub fn channel() -> (BodySender, Body) {
    let (tx, rx) = mpsc::channel(BODY_BUFFER_CHUNKS);
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, io::Error>));
    (BodySender { chunks: PollSender::new(tx) }, body)
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped")
}

impl AsyncWrite for BodySender {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.chunks.poll_reserve(cx)).map_err(|_| gone())?;
        this.chunks.send_item(Bytes::copy_from_slice(buf)).map_err(|_| gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().chunks.close();
        Poll::Ready(Ok(()))
    }
}

impl Transport for BodySender {
    /// The server drops the body once the client has gone.
    fn peer_closed(&self) -> bool {
        self.chunks.get_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientConnection;
    use crate::stream::multipart::{BOUNDARY, part_header};

    #[tokio::test]
    async fn parts_arrive_as_body_bytes() {
        let (sender, body) = channel();
        let mut client = ClientConnection::new(sender);

        let reader = tokio::spawn(axum::body::to_bytes(body, usize::MAX));
        client.send_preamble().await.unwrap();
        client.send_frame(b"\xFF\xD8jpeg\xFF\xD9").await.unwrap();
        assert!(client.is_connected());
        drop(client);

        let mut expected = BOUNDARY.to_vec();
        expected.extend_from_slice(&part_header(8));
        expected.extend_from_slice(b"\xFF\xD8jpeg\xFF\xD9");
        expected.extend_from_slice(BOUNDARY);
        assert_eq!(reader.await.unwrap().unwrap(), Bytes::from(expected));
    }

    #[tokio::test]
    async fn dropped_body_reads_as_a_closed_peer() {
        let (sender, body) = channel();
        let mut client = ClientConnection::new(sender);
        assert!(client.is_connected());

        drop(body);
        assert!(!client.is_connected());
        let err = client.send_frame(b"frame").await.unwrap_err();
        assert!(matches!(err, crate::StreamError::Disconnected { .. }));
    }
}
