//! low-level buffer operations for DNS packet handling

use derive_more::{Display, Error};

/// Longest encoded name, per RFC 1035.
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
/// Bound on compression-pointer hops while walking a name.
const MAX_JUMPS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum BufferError {
    EndOfBuffer,
    LabelTooLong,
    NameTooLong,
    JumpLimitExceeded,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Write cursor over a growable packet buffer.
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> PacketWriter {
        PacketWriter { buf: Vec::new() }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    pub fn write_u16(&mut self, val: u16) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    pub fn write_u32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_be_bytes());
    }

    /// Encodes `qname` as length-prefixed labels with a zero terminator.
    pub fn write_qname(&mut self, qname: &str) -> Result<()> {
        let start = self.pos();
        for label in qname.split('.').filter(|label| !label.is_empty()) {
            if label.len() > MAX_LABEL_LEN {
                return Err(BufferError::LabelTooLong);
            }
            self.write_u8(label.len() as u8);
            self.buf.extend_from_slice(label.as_bytes());
        }
        self.write_u8(0);
        if self.pos() - start > MAX_NAME_LEN {
            return Err(BufferError::NameTooLong);
        }
        Ok(())
    }
}

impl Default for PacketWriter {
    fn default() -> PacketWriter {
        PacketWriter::new()
    }
}

/// Read cursor over received packet bytes.
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> PacketReader<'a> {
        PacketReader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn step(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += n;
        Ok(())
    }

    fn get(&self, pos: usize) -> Result<u8> {
        self.buf.get(pos).copied().ok_or(BufferError::EndOfBuffer)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let val = self.get(self.pos)?;
        self.pos += 1;
        Ok(val)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(((self.read_u8()? as u16) << 8) | self.read_u8()? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(((self.read_u16()? as u32) << 16) | self.read_u16()? as u32)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(BufferError::EndOfBuffer);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Decodes a possibly-compressed name into `out`. Pointers are
    /// followed without moving the cursor past the pointer itself.
    pub fn read_qname(&mut self, out: &mut String) -> Result<()> {
        let mut pos = self.pos;
        let mut jumped = false;
        let mut jumps = 0;
        let mut delim = "";

        loop {
            if jumps > MAX_JUMPS {
                return Err(BufferError::JumpLimitExceeded);
            }

            let len = self.get(pos)?;
            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.pos = pos + 2;
                }
                let low = self.get(pos + 1)? as usize;
                pos = (((len as usize) ^ 0xC0) << 8) | low;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;
            if len == 0 {
                break;
            }
            if pos + len as usize > self.buf.len() {
                return Err(BufferError::EndOfBuffer);
            }
            out.push_str(delim);
            out.push_str(&String::from_utf8_lossy(&self.buf[pos..pos + len as usize]));
            delim = ".";
            pos += len as usize;

            if out.len() > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }
        }

        if !jumped {
            self.pos = pos;
        }
        Ok(())
    }

    /// Advances past a name without decoding it.
    pub fn skip_qname(&mut self) -> Result<()> {
        let mut scratch = String::new();
        self.read_qname(&mut scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_roundtrip() {
        let mut writer = PacketWriter::new();
        writer.write_qname("example.com").unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(&bytes, b"\x07example\x03com\x00");

        let mut reader = PacketReader::new(&bytes);
        let mut name = String::new();
        reader.read_qname(&mut name).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(reader.pos(), bytes.len());
    }

    #[test]
    fn qname_with_trailing_dot() {
        let mut writer = PacketWriter::new();
        writer.write_qname("example.com.").unwrap();
        assert_eq!(&writer.into_bytes(), b"\x07example\x03com\x00");
    }

    #[test]
    fn compressed_name_is_followed_and_cursor_lands_after_pointer() {
        // "com" at offset 0, then "example" + pointer to offset 0
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x03com\x00");
        let name_at = bytes.len();
        bytes.extend_from_slice(b"\x07example");
        bytes.extend_from_slice(&[0xC0, 0x00]);
        bytes.extend_from_slice(b"after");

        let mut reader = PacketReader::new(&bytes);
        reader.step(name_at).unwrap();
        let mut name = String::new();
        reader.read_qname(&mut name).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(&bytes[reader.pos()..], b"after");
    }

    #[test]
    fn pointer_loop_is_bounded() {
        // a pointer that points at itself
        let bytes = [0xC0, 0x00];
        let mut reader = PacketReader::new(&bytes);
        let mut name = String::new();
        assert_eq!(
            reader.read_qname(&mut name),
            Err(BufferError::JumpLimitExceeded)
        );
    }

    #[test]
    fn oversized_label_is_rejected() {
        let mut writer = PacketWriter::new();
        let label = "a".repeat(64);
        assert_eq!(
            writer.write_qname(&label),
            Err(BufferError::LabelTooLong)
        );
    }

    #[test]
    fn truncated_packet_is_end_of_buffer() {
        let bytes = [0x07, b'e', b'x'];
        let mut reader = PacketReader::new(&bytes);
        let mut name = String::new();
        assert_eq!(reader.read_qname(&mut name), Err(BufferError::EndOfBuffer));
    }
}
