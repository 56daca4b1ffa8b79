//! The on-wire message format carried inside Produce and Fetch bodies.
//!
//! A message set is a plain concatenation of entries, each
//! `offset(i64) size(i32) crc(u32) magic(i8) attributes(i8) [timestamp(i64)]
//! key(bytes) value(bytes)`, where the CRC is CRC-32/IEEE over everything
//! from `magic` through the end of `value`. Magic 1 inserts the timestamp
//! field; the low three attribute bits select the compression codec.
//!
//! Compression works by enveloping: the compressed rendition of an inner
//! message set becomes the value of a single outer message whose attributes
//! carry the codec. Brokers may report the *last* inner offset on the outer
//! entry; absolute inner offsets are reconstructed by subtraction.

use std::io::{Cursor, Read, Write};

use super::{
    primitives::{read_exact_vec, Int32, Int64, Int8, NullableBytes},
    traits::{ReadError, ReadType, WriteError, WriteType},
};

/// Codec used for a message's value, from the low attribute bits.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageCompression {
    NoCompression,
    Gzip,
    Snappy,
}

impl MessageCompression {
    pub fn from_attributes(attributes: i8) -> Result<Self, ReadError> {
        match attributes & 0x07 {
            0 => Ok(Self::NoCompression),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            other => Err(ReadError::Malformed(
                format!("Invalid compression type: {other}").into(),
            )),
        }
    }

    fn attributes(&self) -> i8 {
        match self {
            Self::NoCompression => 0,
            Self::Gzip => 1,
            Self::Snappy => 2,
        }
    }
}

/// A single message, the CRC-protected part of a message-set entry.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    pub magic: i8,
    pub attributes: i8,

    /// Milliseconds since epoch, present from magic 1 on.
    pub timestamp: Option<i64>,

    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl Message {
    /// Serialize the CRC-protected region (`magic..value`).
    fn write_body<W>(&self, writer: &mut W) -> Result<(), WriteError>
    where
        W: Write,
    {
        Int8(self.magic).write(writer)?;
        Int8(self.attributes).write(writer)?;
        if self.magic >= 1 {
            Int64(self.timestamp.unwrap_or(-1)).write(writer)?;
        }
        NullableBytes(self.key.clone()).write(writer)?;
        NullableBytes(self.value.clone()).write(writer)?;
        Ok(())
    }

    fn read_body<R>(reader: &mut R) -> Result<Self, ReadError>
    where
        R: Read,
    {
        let magic = Int8::read(reader)?.0;
        if !(0..=1).contains(&magic) {
            return Err(ReadError::Malformed(
                format!("Invalid magic number in message: {magic}").into(),
            ));
        }
        let attributes = Int8::read(reader)?.0;
        MessageCompression::from_attributes(attributes)?;
        let timestamp = (magic >= 1).then(|| Int64::read(reader)).transpose()?;
        let key = NullableBytes::read(reader)?.0;
        let value = NullableBytes::read(reader)?.0;

        Ok(Self {
            magic,
            attributes,
            timestamp: timestamp.map(|t| t.0),
            key,
            value,
        })
    }
}

impl<W> WriteType<W> for Message
where
    W: Write,
{
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let mut body = vec![];
        self.write_body(&mut body)?;

        let crc = crc32fast::hash(&body);
        Int32(i32::from_be_bytes(crc.to_be_bytes())).write(writer)?;
        writer.write_all(&body)?;
        Ok(())
    }
}

impl<R> ReadType<R> for Message
where
    R: Read,
{
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let crc = Int32::read(reader)?.0;
        let crc = u32::from_be_bytes(crc.to_be_bytes());

        let mut body = vec![];
        reader.read_to_end(&mut body)?;

        let actual_crc = crc32fast::hash(&body);
        if crc != actual_crc {
            return Err(ReadError::Malformed(
                format!("CRC error, got 0x{actual_crc:x}, expected 0x{crc:x}").into(),
            ));
        }

        let mut body = Cursor::new(body);
        let message = Self::read_body(&mut body)?;

        let bytes_left = body.get_ref().len() as u64 - body.position();
        if bytes_left != 0 {
            return Err(ReadError::Malformed(
                format!("Found {bytes_left} trailing bytes after message").into(),
            ));
        }

        Ok(message)
    }
}

/// One entry of a message set: an offset plus the message at that offset.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MessageSetEntry {
    pub offset: i64,
    pub message: Message,
}

/// An ordered batch of messages sharing a topic/partition.
///
/// Reading flattens compression envelopes, so consumers only ever observe
/// plain entries.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct MessageSet(pub Vec<MessageSetEntry>);

impl MessageSet {
    /// Wrap `messages` for producing, compressing them into a single
    /// envelope message when a codec is given.
    ///
    /// Offsets in produced sets are placeholders; the broker assigns real
    /// ones on append.
    pub fn compressed(
        compression: MessageCompression,
        messages: Vec<Message>,
    ) -> Result<Self, WriteError> {
        let plain = Self(
            messages
                .into_iter()
                .map(|message| MessageSetEntry {
                    offset: -1,
                    message,
                })
                .collect(),
        );

        if compression == MessageCompression::NoCompression {
            return Ok(plain);
        }

        let mut raw = vec![];
        plain.write(&mut raw)?;
        let compressed = compress(compression, &raw)?;

        Ok(Self(vec![MessageSetEntry {
            offset: -1,
            message: Message {
                magic: 0,
                attributes: compression.attributes(),
                timestamp: None,
                key: None,
                value: Some(compressed),
            },
        }]))
    }

    /// Serialize all entries back-to-back, without a size prefix.
    ///
    /// The surrounding Produce/Fetch partition block carries the size.
    pub fn write<W>(&self, writer: &mut W) -> Result<(), WriteError>
    where
        W: Write,
    {
        for entry in &self.0 {
            let mut message = vec![];
            entry.message.write(&mut message)?;

            Int64(entry.offset).write(writer)?;
            let len = i32::try_from(message.len()).map_err(WriteError::Overflow)?;
            Int32(len).write(writer)?;
            writer.write_all(&message)?;
        }
        Ok(())
    }

    /// Parse `size` bytes worth of entries, unwrapping compression envelopes.
    ///
    /// Brokers cut fetched sets off mid-entry at the byte limit; a truncated
    /// trailing entry is dropped silently.
    pub fn read<R>(reader: &mut R, size: usize) -> Result<Self, ReadError>
    where
        R: Read,
    {
        let buf = read_exact_vec(reader, size)?;
        Self::parse(&buf)
    }

    fn parse(buf: &[u8]) -> Result<Self, ReadError> {
        let len = buf.len() as u64;
        let mut cursor = Cursor::new(buf);
        let mut entries = vec![];

        loop {
            let remaining = len - cursor.position();
            if remaining == 0 {
                break;
            }
            if remaining < 12 {
                // truncated entry header
                break;
            }

            let offset = Int64::read(&mut cursor)?.0;
            let message_size = Int32::read(&mut cursor)?.0;
            let message_size =
                usize::try_from(message_size).map_err(|e| ReadError::Malformed(Box::new(e)))?;

            if (len - cursor.position()) < message_size as u64 {
                // truncated message payload
                break;
            }

            let raw = read_exact_vec(&mut cursor, message_size)?;
            let message = Message::read(&mut Cursor::new(raw))?;

            let compression = MessageCompression::from_attributes(message.attributes)?;
            match compression {
                MessageCompression::NoCompression => {
                    entries.push(MessageSetEntry { offset, message });
                }
                codec => {
                    let value = message.value.as_deref().ok_or_else(|| {
                        ReadError::Malformed("Compressed message with null value".into())
                    })?;
                    let raw_inner = decompress(codec, value)?;
                    let inner = Self::parse(&raw_inner)?;
                    entries.extend(rebase_offsets(offset, inner.0));
                }
            }
        }

        Ok(Self(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Rebase inner-envelope offsets so the last entry lands on the outer offset.
///
/// Brokers either store absolute inner offsets (the delta is then zero) or
/// relative ones with the envelope carrying the last absolute offset.
fn rebase_offsets(outer_offset: i64, mut inner: Vec<MessageSetEntry>) -> Vec<MessageSetEntry> {
    if let Some(last) = inner.last() {
        let delta = outer_offset - last.offset;
        if delta != 0 {
            for entry in &mut inner {
                entry.offset += delta;
            }
        }
    }
    inner
}

#[cfg(feature = "compression-gzip")]
fn compress_gzip(raw: &[u8]) -> Result<Vec<u8>, WriteError> {
    use flate2::{write::GzEncoder, Compression};

    let mut encoder = GzEncoder::new(vec![], Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

#[cfg(feature = "compression-snappy")]
fn compress_snappy(raw: &[u8]) -> Result<Vec<u8>, WriteError> {
    use snap::raw::{max_compress_len, Encoder};

    let mut encoder = Encoder::new();
    let mut output = vec![0; max_compress_len(raw.len())];
    let len = encoder
        .compress(raw, &mut output)
        .map_err(|e| WriteError::Malformed(Box::new(e)))?;
    output.truncate(len);
    Ok(output)
}

fn compress(codec: MessageCompression, raw: &[u8]) -> Result<Vec<u8>, WriteError> {
    match codec {
        MessageCompression::NoCompression => Ok(raw.to_vec()),
        #[cfg(feature = "compression-gzip")]
        MessageCompression::Gzip => compress_gzip(raw),
        #[cfg(feature = "compression-snappy")]
        MessageCompression::Snappy => compress_snappy(raw),
        #[allow(unreachable_patterns)]
        MessageCompression::Gzip => Err(WriteError::UnsupportedCompression { codec: "gzip" }),
        #[allow(unreachable_patterns)]
        MessageCompression::Snappy => Err(WriteError::UnsupportedCompression { codec: "snappy" }),
    }
}

fn decompress(codec: MessageCompression, value: &[u8]) -> Result<Vec<u8>, ReadError> {
    match codec {
        MessageCompression::NoCompression => Ok(value.to_vec()),
        #[cfg(feature = "compression-gzip")]
        MessageCompression::Gzip => {
            use flate2::read::GzDecoder;

            let mut decoder = GzDecoder::new(value);
            let mut out = vec![];
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "compression-snappy")]
        MessageCompression::Snappy => {
            use snap::raw::{decompress_len, Decoder};

            let len = decompress_len(value).map_err(|e| ReadError::Malformed(Box::new(e)))?;
            let mut out = vec![0; len];
            Decoder::new()
                .decompress(value, &mut out)
                .map_err(|e| ReadError::Malformed(Box::new(e)))?;
            Ok(out)
        }
        #[allow(unreachable_patterns)]
        MessageCompression::Gzip => Err(ReadError::UnsupportedCompression { codec: "gzip" }),
        #[allow(unreachable_patterns)]
        MessageCompression::Snappy => Err(ReadError::UnsupportedCompression { codec: "snappy" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            any::<bool>(),
            any::<i64>(),
            any::<Option<Vec<u8>>>(),
            any::<Option<Vec<u8>>>(),
        )
            .prop_map(|(v1, timestamp, key, value)| Message {
                magic: i8::from(v1),
                attributes: 0,
                timestamp: v1.then_some(timestamp),
                key,
                value,
            })
    }

    fn arb_message_set() -> impl Strategy<Value = MessageSet> {
        prop::collection::vec((0i64..1_000_000, arb_message()), 0..4).prop_map(|entries| {
            MessageSet(
                entries
                    .into_iter()
                    .map(|(offset, message)| MessageSetEntry { offset, message })
                    .collect(),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig{cases: 100, fork: false, ..Default::default()})]
        #[test]
        fn test_message_roundtrip(orig in arb_message()) {
            let mut buf = vec![];
            orig.write(&mut buf).unwrap();

            let restored = Message::read(&mut Cursor::new(buf)).unwrap();
            assert_eq!(orig, restored);
        }

        #[test]
        fn test_message_set_roundtrip(orig in arb_message_set()) {
            let mut buf = vec![];
            orig.write(&mut buf).unwrap();

            let size = buf.len();
            let restored = MessageSet::read(&mut Cursor::new(buf), size).unwrap();
            assert_eq!(orig, restored);
        }

        #[test]
        fn test_crc_rejects_mutation(orig in arb_message(), flip in 4usize..64) {
            let mut buf = vec![];
            orig.write(&mut buf).unwrap();

            // flip one bit somewhere past the CRC field
            let index = 4 + (flip % (buf.len() - 4));
            buf[index] ^= 0x01;

            let err = Message::read(&mut Cursor::new(buf)).unwrap_err();
            assert_matches!(err, ReadError::Malformed(_));
        }
    }

    #[test]
    fn test_crc_polynomial_is_ieee() {
        // CRC-32/ISO-HDLC check value, see the reveng catalogue
        assert_eq!(crc32fast::hash(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let set = MessageSet(vec![
            MessageSetEntry {
                offset: 3,
                message: Message {
                    magic: 0,
                    attributes: 0,
                    timestamp: None,
                    key: None,
                    value: Some(b"whole".to_vec()),
                },
            },
            MessageSetEntry {
                offset: 4,
                message: Message {
                    magic: 0,
                    attributes: 0,
                    timestamp: None,
                    key: None,
                    value: Some(b"cut off".to_vec()),
                },
            },
        ]);

        let mut buf = vec![];
        set.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 5);

        let size = buf.len();
        let restored = MessageSet::read(&mut Cursor::new(buf), size).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.0[0].offset, 3);
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_envelope_offset_reconstruction() {
        // inner entries at relative offsets 0,1,2; outer carries the last
        // absolute offset 7 -> caller sees 5,6,7
        let inner = MessageSet(
            (0..3)
                .map(|i| MessageSetEntry {
                    offset: i,
                    message: Message {
                        magic: 0,
                        attributes: 0,
                        timestamp: None,
                        key: None,
                        value: Some(format!("v{i}").into_bytes()),
                    },
                })
                .collect(),
        );
        let mut raw_inner = vec![];
        inner.write(&mut raw_inner).unwrap();

        let envelope = MessageSet(vec![MessageSetEntry {
            offset: 7,
            message: Message {
                magic: 0,
                attributes: 1,
                timestamp: None,
                key: None,
                value: Some(compress(MessageCompression::Gzip, &raw_inner).unwrap()),
            },
        }]);
        let mut buf = vec![];
        envelope.write(&mut buf).unwrap();

        let size = buf.len();
        let restored = MessageSet::read(&mut Cursor::new(buf), size).unwrap();
        let offsets: Vec<_> = restored.0.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![5, 6, 7]);
        assert_eq!(restored.0[2].message.value, Some(b"v2".to_vec()));
    }

    #[cfg(feature = "compression-snappy")]
    #[test]
    fn test_snappy_envelope_roundtrip() {
        let messages: Vec<_> = (0..3)
            .map(|i| Message {
                magic: 0,
                attributes: 0,
                timestamp: None,
                key: Some(vec![i]),
                value: Some(vec![b'x'; 100]),
            })
            .collect();

        let set = MessageSet::compressed(MessageCompression::Snappy, messages.clone()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.0[0].message.attributes & 0x07, 2);

        let mut buf = vec![];
        set.write(&mut buf).unwrap();

        let size = buf.len();
        let restored = MessageSet::read(&mut Cursor::new(buf), size).unwrap();
        assert_eq!(restored.len(), 3);
        for (entry, message) in restored.0.iter().zip(&messages) {
            assert_eq!(&entry.message, message);
        }
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let err = MessageCompression::from_attributes(0x05).unwrap_err();
        assert_matches!(err, ReadError::Malformed(_));
        assert_eq!(err.to_string(), "Malformed data: Invalid compression type: 5");
    }
}
