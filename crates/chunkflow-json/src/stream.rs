use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use chunkflow_body::{ByteStream, Error};
use chunkflow_core::{DecoderConfig, Separator};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Decoder, JsonError, RawValue};

/// Decode a body into a lazy stream of `T` values.
pub fn decode_stream<T: DeserializeOwned>(body: ByteStream, config: &DecoderConfig) -> JsonStream<T> {
    JsonStream::new(body, Decoder::new(config.clone()))
}

/// Lazily decoded values of a concatenated-JSON body.
///
/// Each poll pulls body chunks only until at least one value is complete,
/// so values surface while the body is still arriving. Values completed
/// before a failure are yielded before the error. The body stream is
/// dropped as soon as this stream reaches a terminal item.
pub struct JsonStream<T> {
    upstream: Option<ByteStream>,
    decoder: Decoder,
    pending: VecDeque<RawValue>,
    failure: Option<JsonError>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStream<T> {
    pub fn new(body: ByteStream, decoder: Decoder) -> Self {
        Self {
            upstream: Some(body),
            decoder,
            pending: VecDeque::new(),
            failure: None,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Bytes of body consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.decoder.state().offset()
    }

    fn fail(&mut self, error: JsonError) {
        self.failure = Some(error);
        self.upstream = None;
    }

    fn terminate(&mut self) {
        self.done = true;
        self.pending.clear();
        self.upstream = None;
    }
}

impl<T: DeserializeOwned> Stream for JsonStream<T> {
    type Item = Result<T, JsonError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(raw) = this.pending.pop_front() {
                let value = raw.deserialize();
                if value.is_err() {
                    this.terminate();
                }
                return Poll::Ready(Some(value));
            }
            if let Some(error) = this.failure.take() {
                this.terminate();
                return Poll::Ready(Some(Err(error)));
            }
            let Some(upstream) = this.upstream.as_mut() else {
                this.terminate();
                return Poll::Ready(None);
            };

            let mut completed = Vec::new();
            match ready!(upstream.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    if let Err(e) = this.decoder.feed(&chunk, &mut completed) {
                        this.fail(e);
                    }
                }
                Some(Err(e)) => this.fail(e.into()),
                None => {
                    this.upstream = None;
                    if let Err(e) = this.decoder.finish(&mut completed) {
                        this.failure = Some(e);
                    }
                }
            }
            this.pending.extend(completed);
        }
    }
}

/// Encode a stream of values as a concatenated-JSON body, one chunk per
/// value.
///
/// Values are serialised only as the body is pulled. A value that fails to
/// serialise ends the body with a producer error.
pub fn encode_values<S, T>(values: S, separator: Separator) -> ByteStream
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + 'static,
{
    let delimiter: &'static [u8] = match separator {
        Separator::Optional => b"",
        Separator::Whitespace => b" ",
        Separator::Newline => b"\n",
    };
    ByteStream::new(values.map(move |value| {
        let mut buf = serde_json::to_vec(&value)
            .map_err(|e| Error::producer(format!("failed to encode value: {e}")))?;
        buf.extend_from_slice(delimiter);
        Ok::<Bytes, Error>(Bytes::from(buf))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::mpsc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Event {
        id: u32,
        kind: String,
    }

    fn event(id: u32) -> Event {
        Event {
            id,
            kind: "tick".to_string(),
        }
    }

    #[tokio::test]
    async fn yields_values_split_across_chunks() {
        let body = ByteStream::from_chunks([r#"{"a":1}{"#, r#""a":2}"#]);
        let values: Vec<serde_json::Value> = decode_stream::<serde_json::Value>(body, &DecoderConfig::default())
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(values, vec![serde_json::json!({"a":1}), serde_json::json!({"a":2})]);
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let body = ByteStream::once(r#"{"a":1"#);
        let mut stream = decode_stream::<serde_json::Value>(body, &DecoderConfig::default());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, JsonError::UnexpectedEof { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn values_before_body_error_are_delivered() {
        let body = ByteStream::new(futures_util::stream::iter(vec![
            Ok(Bytes::from(r#"{"id":1,"kind":"tick"}{"id":2,"#)),
            Err(Error::Closed),
        ]));
        let mut stream = decode_stream::<Event>(body, &DecoderConfig::default());
        assert_eq!(stream.next().await.unwrap().unwrap(), event(1));
        assert!(matches!(
            stream.next().await.unwrap().unwrap_err(),
            JsonError::Body(Error::Closed)
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn type_mismatch_ends_stream() {
        let body = ByteStream::once(r#"{"id":1,"kind":"tick"} {"id":"x","kind":"tick"} {"id":3,"kind":"tick"}"#);
        let mut stream = decode_stream::<Event>(body, &DecoderConfig::default());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await.unwrap().unwrap_err(),
            JsonError::Parse { offset: 23, .. }
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn upstream_released_on_parse_error() {
        let (tx, rx) = mpsc::channel();
        let body = ByteStream::from_chunks(["[1,2]", "]", "[3]"])
            .on_finalize_case(move |exit| tx.send(exit).unwrap());
        let mut stream = decode_stream::<Vec<u32>>(body, &DecoderConfig::default());

        assert_eq!(stream.next().await.unwrap().unwrap(), vec![1, 2]);
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(rx.try_recv().unwrap(), chunkflow_body::Exit::Cancelled);
    }

    #[tokio::test]
    async fn infinite_body_is_consumed_on_demand() {
        let body = encode_values(futures_util::stream::iter(0u32..).map(event), Separator::Newline);
        let first: Vec<Event> = decode_stream::<Event>(body, &DecoderConfig::default())
            .take(3)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(first, vec![event(0), event(1), event(2)]);
    }

    #[tokio::test]
    async fn encode_values_separators() {
        let body = encode_values(futures_util::stream::iter([1, 2, 3]), Separator::Optional);
        assert_eq!(body.collect().await.unwrap(), "123");

        let body = encode_values(futures_util::stream::iter([1, 2]), Separator::Newline);
        assert_eq!(body.collect().await.unwrap(), "1\n2\n");
    }
}
