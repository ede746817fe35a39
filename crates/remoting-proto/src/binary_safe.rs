//! Binary-safe transport codec
//!
//! Transcodes an arbitrary byte stream into base64 groups so it survives
//! transports that only carry printable text. Every flush pads the pending
//! group, and the decoder accepts padded groups anywhere in the stream, so
//! both sides may split writes and reads at arbitrary boundaries.

use crate::ProtocolError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Encode a complete buffer
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a complete buffer
pub fn decode(text: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = Decoder::new();
    let mut out = Vec::with_capacity(text.len() / 4 * 3);
    decoder.decode(text, &mut out)?;
    if decoder.has_partial() {
        return Err(ProtocolError::InvalidEncoding(" truncated group".to_string()));
    }
    Ok(out)
}

/// Incremental encoder
#[derive(Debug, Default)]
pub struct Encoder {
    triplet: [u8; 3],
    len: usize,
}

impl Encoder {
    /// Create an encoder with nothing pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `input`, appending complete groups to `out`. Up to two trailing
    /// bytes stay pending until more input arrives or [`Encoder::finish`].
    pub fn encode(&mut self, mut input: &[u8], out: &mut Vec<u8>) {
        if self.len > 0 {
            while self.len < 3 && !input.is_empty() {
                self.triplet[self.len] = input[0];
                self.len += 1;
                input = &input[1..];
            }
            if self.len < 3 {
                return;
            }
            push_encoded(&self.triplet, out);
            self.len = 0;
        }

        let whole = input.len() / 3 * 3;
        if whole > 0 {
            push_encoded(&input[..whole], out);
        }
        for &b in &input[whole..] {
            self.triplet[self.len] = b;
            self.len += 1;
        }
    }

    /// Emit the pending bytes as a padded group
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.len > 0 {
            push_encoded(&self.triplet[..self.len], out);
            self.len = 0;
        }
    }
}

fn push_encoded(bytes: &[u8], out: &mut Vec<u8>) {
    let mut text = String::with_capacity((bytes.len() + 2) / 3 * 4);
    STANDARD.encode_string(bytes, &mut text);
    out.extend_from_slice(text.as_bytes());
}

/// Incremental decoder
#[derive(Debug, Default)]
pub struct Decoder {
    group: Vec<u8>,
}

impl Decoder {
    /// Create a decoder at a group boundary
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `input`, appending the recovered bytes to `out`.
    ///
    /// Whitespace is skipped. A partial group at the end of `input` is kept
    /// until the rest of it arrives.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        for (i, &b) in input.iter().enumerate() {
            if b.is_ascii_whitespace() {
                continue;
            }
            if !is_alphabet(b) {
                return Err(ProtocolError::InvalidEncoding(hex_dump(&input[i..])));
            }
            self.group.push(b);
            // a padded group ends a run; decode what we have so far
            if b == b'=' && self.group.len() % 4 == 0 {
                self.drain(self.group.len(), out)?;
            }
        }

        let whole = self.group.len() / 4 * 4;
        if whole > 0 {
            self.drain(whole, out)?;
        }
        Ok(())
    }

    fn drain(&mut self, upto: usize, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        STANDARD
            .decode_vec(&self.group[..upto], out)
            .map_err(|e| ProtocolError::InvalidEncoding(format!(" {}", e)))?;
        self.group.drain(..upto);
        Ok(())
    }

    /// Whether an incomplete group is buffered
    pub fn has_partial(&self) -> bool {
        !self.group.is_empty()
    }
}

fn is_alphabet(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(16)
        .map(|b| format!(" {:02x}", b))
        .collect()
}

fn invalid_data(err: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encoding wrapper around a blocking writer
pub struct BinarySafeWriter<W> {
    inner: W,
    encoder: Encoder,
    buf: Vec<u8>,
}

impl<W: Write> BinarySafeWriter<W> {
    /// Wrap `inner`
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: Encoder::new(),
            buf: Vec::new(),
        }
    }

    /// Flush the pending group and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BinarySafeWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.encoder.encode(data, &mut self.buf);
        self.inner.write_all(&self.buf)?;
        self.buf.clear();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.finish(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        self.buf.clear();
        self.inner.flush()
    }
}

/// Decoding wrapper around a blocking reader
pub struct BinarySafeReader<R> {
    inner: R,
    decoder: Decoder,
    raw: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
}

impl<R: Read> BinarySafeReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: Decoder::new(),
            raw: vec![0; 8192],
            decoded: Vec::new(),
            pos: 0,
        }
    }
}

impl<R: Read> Read for BinarySafeReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos == self.decoded.len() {
            self.decoded.clear();
            self.pos = 0;
            let n = self.inner.read(&mut self.raw)?;
            if n == 0 {
                if self.decoder.has_partial() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encoded group",
                    ));
                }
                return Ok(0);
            }
            self.decoder
                .decode(&self.raw[..n], &mut self.decoded)
                .map_err(invalid_data)?;
        }
        let n = out.len().min(self.decoded.len() - self.pos);
        out[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Encoding wrapper around an async writer
pub struct AsyncBinarySafeWriter<W> {
    inner: W,
    encoder: Encoder,
    pending: Vec<u8>,
    written: usize,
}

impl<W: AsyncWrite + Unpin> AsyncBinarySafeWriter<W> {
    /// Wrap `inner`
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: Encoder::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AsyncBinarySafeWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.encoder.encode(data, &mut this.pending);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.encoder.finish(&mut this.pending);
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.encoder.finish(&mut this.pending);
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Decoding wrapper around an async reader
pub struct AsyncBinarySafeReader<R> {
    inner: R,
    decoder: Decoder,
    raw: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> AsyncBinarySafeReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: Decoder::new(),
            raw: vec![0; 8192],
            decoded: Vec::new(),
            pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for AsyncBinarySafeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        while this.pos == this.decoded.len() {
            this.decoded.clear();
            this.pos = 0;
            let mut raw = ReadBuf::new(&mut this.raw);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let filled = raw.filled();
            if filled.is_empty() {
                if this.decoder.has_partial() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encoded group",
                    )));
                }
                return Poll::Ready(Ok(()));
            }
            this.decoder
                .decode(filled, &mut this.decoded)
                .map_err(invalid_data)?;
        }
        let n = buf.remaining().min(this.decoded.len() - this.pos);
        buf.put_slice(&this.decoded[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn encode_chunked(data: &[u8], rng: &mut impl Rng) -> Vec<u8> {
        let mut writer = BinarySafeWriter::new(Vec::new());
        let mut rest = data;
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(300));
            writer.write_all(&rest[..n]).unwrap();
            // flush at random points to scatter padded groups through the stream
            if rng.gen_bool(0.2) {
                writer.flush().unwrap();
            }
            rest = &rest[n..];
        }
        writer.finish().unwrap()
    }

    fn decode_chunked(encoded: Vec<u8>, rng: &mut impl Rng) -> Vec<u8> {
        let mut reader = BinarySafeReader::new(Cursor::new(encoded));
        let mut out = Vec::new();
        loop {
            let mut buf = vec![0; rng.gen_range(1..=257)];
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_empty_and_single_byte() {
        assert_eq!(decode(encode(&[]).as_bytes()).unwrap(), Vec::<u8>::new());
        assert_eq!(decode(encode(&[0xff]).as_bytes()).unwrap(), vec![0xff]);

        let mut writer = BinarySafeWriter::new(Vec::new());
        writer.write_all(&[7]).unwrap();
        let encoded = writer.finish().unwrap();
        assert_eq!(encoded, b"Bw==");
    }

    #[test]
    fn test_large_single_write() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let data: Vec<u8> = (0..200_000).map(|_| rng.gen()).collect();

        let mut writer = BinarySafeWriter::new(Vec::new());
        writer.write_all(&data).unwrap();
        let encoded = writer.finish().unwrap();
        assert!(encoded.iter().all(|b| is_alphabet(*b)));

        assert_eq!(decode_chunked(encoded, &mut rng), data);
    }

    #[test]
    fn test_padded_groups_mid_stream() {
        let mut writer = BinarySafeWriter::new(Vec::new());
        for chunk in [&b"a"[..], b"bc", b"def", b"g"] {
            writer.write_all(chunk).unwrap();
            writer.flush().unwrap();
        }
        let encoded = writer.finish().unwrap();
        assert_eq!(decode(&encoded).unwrap(), b"abcdefg");
    }

    #[test]
    fn test_whitespace_is_ignored() {
        assert_eq!(decode(b"aGVs\r\nbG8=\n").unwrap(), b"hello");
    }

    #[test]
    fn test_invalid_byte_reports_hex() {
        let err = decode(b"aGVs*bG8=").unwrap_err();
        match err {
            ProtocolError::InvalidEncoding(dump) => assert!(dump.starts_with(" 2a 62")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_truncated_group_is_an_error() {
        let mut reader = BinarySafeReader::new(Cursor::new(b"aGVsbG".to_vec()));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_async_duplex_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            let mut writer = AsyncBinarySafeWriter::new(client);
            for chunk in data.chunks(777) {
                writer.write_all(chunk).await.unwrap();
                writer.flush().await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut reader = AsyncBinarySafeReader::new(server);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();

        assert_eq!(out, expected);
    }

    proptest! {
        #[test]
        fn test_random_chunking_roundtrip(
            data in prop::collection::vec(any::<u8>(), 0..70_000),
            seed in any::<u64>()
        ) {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let encoded = encode_chunked(&data, &mut rng);
            let decoded = decode_chunked(encoded, &mut rng);
            prop_assert_eq!(decoded, data);
        }

        #[test]
        fn test_async_random_reads(
            data in prop::collection::vec(any::<u8>(), 1..5_000),
            read_size in 1usize..64
        ) {
            tokio_test::block_on(async {
                let mut writer = AsyncBinarySafeWriter::new(Vec::new());
                writer.write_all(&data).await.unwrap();
                writer.flush().await.unwrap();

                let mut reader = AsyncBinarySafeReader::new(Cursor::new(writer.inner));
                let mut out = Vec::new();
                let mut buf = vec![0; read_size];
                loop {
                    let n = reader.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                prop_assert_eq!(out, data);
                Ok(())
            })?;
        }
    }
}
