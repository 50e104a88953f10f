//! Response body plumbing between a handler conn and hyper.
//!
//! The conn pushes frames into a bounded channel; the receiving half is the
//! body of the `http::Response` returned to axum.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, SinkExt};
use futures::stream::BoxStream;
use http::HeaderMap;
use http_body::Frame;
use http_body_util::StreamBody;
use rpcwire_core::Error;

/// Frames buffered between the conn and the connection task.
const FRAME_BUFFER: usize = 8;

/// Request messages as a stream of byte chunks.
pub(crate) type RequestStream = BoxStream<'static, Result<Bytes, Error>>;

type FrameResult = Result<Frame<Bytes>, Error>;

pub(crate) fn channel() -> (BodySink, Body) {
    let (tx, rx) = mpsc::channel::<FrameResult>(FRAME_BUFFER);
    (BodySink { tx }, Body::new(StreamBody::new(rx)))
}

fn disconnected<T>(_: T) -> Error {
    Error::canceled("client disconnected")
}

/// Write half of a response body.
#[derive(Debug)]
pub(crate) struct BodySink {
    tx: mpsc::Sender<FrameResult>,
}

impl BodySink {
    /// Send HTTP trailers. Must be the last frame.
    pub(crate) async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), Error> {
        self.tx
            .send(Ok(Frame::trailers(trailers)))
            .await
            .map_err(disconnected)
    }

    /// End the body. Frames already queued are still delivered.
    pub(crate) fn finish(&mut self) {
        self.tx.close_channel();
    }
}

impl Sink<Bytes> for BodySink {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.tx.poll_ready(cx).map_err(disconnected)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Error> {
        self.tx.start_send(Ok(Frame::data(item))).map_err(disconnected)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Pin::new(&mut self.tx).poll_flush(cx).map_err(disconnected)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Pin::new(&mut self.tx).poll_close(cx).map_err(disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_sink_feeds_body() {
        let (mut sink, body) = channel();
        sink.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        sink.send_trailers(trailers).await.unwrap();
        sink.finish();

        let collected = body.collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["grpc-status"], "0");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_dropped_body_reports_disconnect() {
        let (mut sink, body) = channel();
        drop(body);
        let err = sink.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.code(), rpcwire_core::Code::Canceled);
    }
}
