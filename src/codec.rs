//! Byte/value codecs as channel transformers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::channel::{Channel, Transformer};
use crate::error::ChannelError;
use crate::sink::{ChannelSink, MappedCore};
use crate::stream::ChannelStream;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

type DecodeFn<I, O> = dyn Fn(I) -> Result<O, ChannelError> + Send + Sync;
type EncodeFn<I, O> = dyn Fn(&O) -> Result<I, ChannelError> + Send + Sync;

/// A symmetric codec wrapped as a [`Transformer`]: incoming raw items are
/// decoded one message per document, outgoing values are encoded back.
///
/// Decode failures surface as in-band [`ChannelError::Protocol`] events;
/// encode failures are returned synchronously from the `add` call.
pub struct CodecTransformer<I, O> {
    decode: Arc<DecodeFn<I, O>>,
    encode: Arc<EncodeFn<I, O>>,
}

impl<I, O> CodecTransformer<I, O> {
    pub fn new<D, E>(decode: D, encode: E) -> Self
    where
        D: Fn(I) -> Result<O, ChannelError> + Send + Sync + 'static,
        E: Fn(&O) -> Result<I, ChannelError> + Send + Sync + 'static,
    {
        Self {
            decode: Arc::new(decode),
            encode: Arc::new(encode),
        }
    }

    /// Adds a fallback applied to values the encoder rejects: the value is
    /// mapped into a representable stand-in and encoded again.
    pub fn with_fallback<F>(self, fallback: F) -> Self
    where
        F: Fn(&O) -> Result<O, ChannelError> + Send + Sync + 'static,
        I: 'static,
        O: 'static,
    {
        let encode = self.encode.clone();
        Self {
            decode: self.decode,
            encode: Arc::new(move |value| {
                (*encode)(value).or_else(|_| {
                    let stand_in = fallback(value)?;
                    (*encode)(&stand_in)
                })
            }),
        }
    }
}

impl<I, O> Clone for CodecTransformer<I, O> {
    fn clone(&self) -> Self {
        Self {
            decode: self.decode.clone(),
            encode: self.encode.clone(),
        }
    }
}

impl<I, O> Transformer<I, O> for CodecTransformer<I, O>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
{
    fn bind(self, channel: Channel<I>) -> Channel<O> {
        let (stream, sink) = channel.split();
        let decode = self.decode;
        let stream = ChannelStream::from_stream(stream.map(move |event| match event {
            Ok(raw) => (*decode)(raw),
            Err(error) => Err(error),
        }));
        let sink = ChannelSink::from_core(Arc::new(MappedCore {
            inner: sink,
            map: self.encode,
        }));
        Channel::new(stream, sink)
    }
}

/// JSON document codec over byte payloads: one message per document.
pub fn json_document() -> CodecTransformer<Bytes, serde_json::Value> {
    CodecTransformer::new(
        |bytes: Bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|error| ChannelError::Protocol(format!("invalid JSON document: {error}")))
        },
        |value: &serde_json::Value| {
            serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|error| ChannelError::Encode(error.to_string()))
        },
    )
}

/// Typed JSON codec over byte payloads.
pub fn json<T>() -> CodecTransformer<Bytes, T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    CodecTransformer::new(
        |bytes: Bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|error| ChannelError::Protocol(format!("invalid JSON document: {error}")))
        },
        |value: &T| {
            serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|error| ChannelError::Encode(error.to_string()))
        },
    )
}
