//! Wire frames carried by a multiplexed channel.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::marker::PhantomData;

/// One frame on the underlying channel of a [`Multiplexer`].
///
/// On the wire a frame is an ordered record: `[id, payload]` carries a
/// message for the virtual channel `id`, `[id]` announces its closure. No
/// other shape is accepted; decoding anything else is a protocol
/// violation.
///
/// [`Multiplexer`]: super::Multiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<T> {
    /// A payload for the virtual channel `id`.
    Message { id: u64, payload: T },
    /// The virtual channel `id` was closed by the sender.
    Close { id: u64 },
}

impl<T> Frame<T> {
    /// The virtual channel this frame belongs to.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Message { id, .. } | Frame::Close { id } => *id,
        }
    }
}

impl<T: Serialize> Serialize for Frame<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Frame::Message { id, payload } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(id)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Frame::Close { id } => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(id)?;
                seq.end()
            }
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Frame<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for FrameVisitor<T> {
            type Value = Frame<T>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a frame of the shape [id] or [id, payload]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Frame<T>, A::Error> {
                let id: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match seq.next_element::<T>()? {
                    Some(payload) => {
                        if seq.next_element::<IgnoredAny>()?.is_some() {
                            return Err(de::Error::custom("frame has trailing elements"));
                        }
                        Ok(Frame::Message { id, payload })
                    }
                    None => Ok(Frame::Close { id }),
                }
            }
        }

        deserializer.deserialize_seq(FrameVisitor(PhantomData))
    }
}
