//! Framing of [`Message`]s on the TCP connections of a job. Each frame is a
//! length prefix followed by the `bincode` encoding of one message, so a
//! reader never sees half an envelope.
use crate::error::PoolError;
use crate::network::{Message, MessageCodec};
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted. A share of a scattered column must fit in it.
const MAX_FRAME_SIZE: usize = 1 << 30;

impl<T> Message<T> {
    /// Wraps `msg` for delivery from rank `sender_id` to rank `target_id`.
    pub fn new(msg_id: usize, sender_id: usize, target_id: usize, msg: T) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T> MessageCodec<T> {
    /// A codec for frames of at most `MAX_FRAME_SIZE` bytes
    pub(crate) fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = PoolError;
    /// Yields `None` until `src` holds a whole frame, then deserializes it.
    /// Oversized frames and bodies that are not a `Message<T>` are errors.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = PoolError;
    /// Serializes `item` and appends it to `dst` behind its length.
    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}
