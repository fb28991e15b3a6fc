//! Event file framing: `[u32 big-endian length][serde_json EventMessage]`

use std::io::{self, Read};

use serde::Serialize;

use crate::error::Result;
use crate::types::EventMessage;

/// Size of the length prefix
pub(crate) const LEN_PREFIX: usize = 4;

/// Encode one event as a framed record
pub(crate) fn encode_record<E: Serialize>(event: &EventMessage<E>) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(event)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event of {} bytes exceeds the record size limit", body.len()),
        )
    })?;

    let mut record = Vec::with_capacity(LEN_PREFIX + body.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// One step of reading an event file
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A whole record body
    Record(Vec<u8>),
    /// Clean end of file
    End,
    /// The file ends inside its last record; `valid_len` is where that record starts
    Torn { valid_len: u64 },
    /// A length prefix that cannot be right; records may follow it
    Corrupt { at: u64, reason: String },
}

/// Sequential record reader tracking the byte offset of the next record
pub(crate) struct RecordReader<R> {
    reader: R,
    offset: u64,
    end: u64,
}

impl<R: Read> RecordReader<R> {
    /// `offset` is the file position `reader` is already at, `end` the file length
    pub(crate) fn new(reader: R, offset: u64, end: u64) -> Self {
        Self {
            reader,
            offset,
            end,
        }
    }

    /// Offset of the next unread record
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn next_frame(&mut self) -> io::Result<Frame> {
        let mut header = [0u8; LEN_PREFIX];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(Frame::End),
            n if n < LEN_PREFIX => return Ok(Frame::Torn { valid_len: self.offset }),
            _ => {}
        }

        let len = u64::from(u32::from_be_bytes(header));
        let remaining = self.end.saturating_sub(self.offset + LEN_PREFIX as u64);
        if len > remaining {
            return self.overrun(len, remaining);
        }

        let mut body = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut body)? < body.len() {
            return Ok(Frame::Torn { valid_len: self.offset });
        }

        self.offset += LEN_PREFIX as u64 + len;
        Ok(Frame::Record(body))
    }

    /// The prefix claims more bytes than the file holds.
    ///
    /// An interrupted append leaves a body that is a cut-off JSON value. If
    /// the rest of the file instead starts with a complete value, the prefix
    /// itself is wrong and truncating would discard good records.
    fn overrun(&mut self, len: u64, remaining: u64) -> io::Result<Frame> {
        let mut rest = Vec::with_capacity(remaining as usize);
        (&mut self.reader).take(remaining).read_to_end(&mut rest)?;

        let mut values =
            serde_json::Deserializer::from_slice(&rest).into_iter::<serde::de::IgnoredAny>();
        match values.next() {
            Some(Ok(_)) => Ok(Frame::Corrupt {
                at: self.offset,
                reason: format!(
                    "record length {len} overruns the file but a whole record follows it"
                ),
            }),
            _ => Ok(Frame::Torn { valid_len: self.offset }),
        }
    }
}

/// Fill `buf` as far as the reader allows; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
