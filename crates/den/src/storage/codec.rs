//! Little-endian field encoding shared by the binary file formats.

use crate::error::{DenError, Result};
use crate::frame::{ChannelSample, Frame, PayloadKind, StoredFrame};

/// Growable buffer for encoding record payloads.
#[derive(Debug, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a `u16` length prefix followed by UTF-8 bytes.
    pub(crate) fn put_str(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| DenError::Corrupt(format!("string too long: {} bytes", s.len())))?;
        self.put_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Writes a `u32` length prefix followed by raw bytes.
    pub(crate) fn put_bytes(&mut self, b: &[u8]) -> Result<()> {
        let len = u32::try_from(b.len())
            .map_err(|_| DenError::Corrupt(format!("payload too long: {} bytes", b.len())))?;
        self.put_u32(len);
        self.buf.extend_from_slice(b);
        Ok(())
    }

    pub(crate) fn put_frame(&mut self, stored: &StoredFrame) -> Result<()> {
        self.put_u64(stored.index);
        let samples = stored.frame.samples();
        let count = u32::try_from(samples.len())
            .map_err(|_| DenError::Corrupt("too many samples in frame".to_string()))?;
        self.put_u32(count);
        for sample in samples {
            self.put_str(&sample.name)?;
            self.put_f64(sample.time);
            self.put_f64(sample.duration);
            self.put_u8(sample.kind.as_u8());
            self.put_bytes(&sample.payload)?;
        }
        Ok(())
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked reader over an encoded payload.
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                DenError::Corrupt(format!(
                    "truncated field: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn take_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DenError::Corrupt(format!("invalid UTF-8 string: {e}")))
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn kind(&mut self) -> Result<PayloadKind> {
        let tag = self.u8()?;
        PayloadKind::from_u8(tag)
            .ok_or_else(|| DenError::Corrupt(format!("unknown payload kind {tag}")))
    }

    pub(crate) fn frame(&mut self) -> Result<StoredFrame> {
        let index = self.u64()?;
        let count = self.u32()? as usize;
        let mut samples = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = self.string()?;
            let time = self.f64()?;
            let duration = self.f64()?;
            let kind = self.kind()?;
            let payload = self.bytes()?;
            samples.push(ChannelSample {
                name,
                time,
                duration,
                kind,
                payload,
            });
        }
        Ok(StoredFrame::new(index, Frame::new(samples)))
    }
}
