//! Adapter from `http_body::Body` to a stream of data chunks.

use std::error::Error as StdError;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use http::HeaderMap;
use http_body::Body;
use pin_project_lite::pin_project;

use crate::code::Code;
use crate::error::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Maps body errors to coded errors.
pub type ClassifyFn = fn(BoxError) -> Error;

fn classify_default(err: BoxError) -> Error {
    Error::from_source(&*err, Code::Unknown)
}

pin_project! {
    /// Yields the data frames of a body and keeps its trailers.
    pub struct BodyStream<B> {
        #[pin]
        body: B,
        trailers: Option<HeaderMap>,
        classify: ClassifyFn,
        done: bool,
    }
}

impl<B> BodyStream<B> {
    pub fn new(body: B) -> Self {
        Self::with_classifier(body, classify_default)
    }

    /// Use `classify` for errors returned by the body.
    pub fn with_classifier(body: B, classify: ClassifyFn) -> Self {
        Self {
            body,
            trailers: None,
            classify,
            done: false,
        }
    }

    /// Trailers received so far.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

impl<B> Stream for BodyStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.body.as_mut().poll_frame(cx)) {
                None => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Some(Err(err)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err((this.classify)(err.into()))));
                }
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) if data.is_empty() => continue,
                    Ok(data) => return Poll::Ready(Some(Ok(data))),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.trailers
                                .get_or_insert_with(HeaderMap::new)
                                .extend(trailers);
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use http_body::Frame;
    use http_body_util::StreamBody;

    #[tokio::test]
    async fn test_body_stream_keeps_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        let frames = vec![
            Ok::<_, Error>(Frame::data(Bytes::from_static(b"ab"))),
            Ok(Frame::data(Bytes::new())),
            Ok(Frame::data(Bytes::from_static(b"c"))),
            Ok(Frame::trailers(trailers)),
        ];
        let mut stream = BodyStream::new(StreamBody::new(futures::stream::iter(frames)));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"c"));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.trailers().unwrap()["grpc-status"], "0");
    }

    #[tokio::test]
    async fn test_body_stream_classifies_errors() {
        let frames = vec![Err::<Frame<Bytes>, _>(Error::data_loss("gone"))];
        let mut stream = BodyStream::new(StreamBody::new(futures::stream::iter(frames)));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DataLoss);
        assert!(stream.next().await.is_none());
    }
}
