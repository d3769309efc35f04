use crate::error::{HistError, Result};
use crate::sub_file_stream::{BlockArgs, SubFileIoSession};

/// Longest 7-bit encoding of a `u64`.
const MAX_7BIT_U64_LEN: usize = 10;

/// Strings are read in steps of this many bytes, so a damaged length prefix
/// fails on the first missing block instead of sizing one huge buffer.
const STRING_CHUNK: usize = 4096;

macro_rules! le_accessors {
    ($($read:ident, $write:ident, $ty:ty;)*) => {
        $(
            pub fn $read(&mut self) -> Result<$ty> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            pub fn $write(&mut self, value: $ty) -> Result<()> {
                self.write_all(&value.to_le_bytes())
            }
        )*
    };
}

/// Typed little-endian reads and writes over a sub-file, with a position
/// cursor. Block boundaries are crossed by asking the session for the next
/// block; a write into a block mapped for reading re-maps it for writing.
pub struct BinaryStream {
    session: SubFileIoSession,
    position: i64,
    current: Option<BlockArgs>,
}

impl BinaryStream {
    pub fn new(session: SubFileIoSession) -> Self {
        BinaryStream {
            session,
            position: 0,
            current: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn set_position(&mut self, position: i64) {
        self.position = position;
    }

    pub fn session(&self) -> &SubFileIoSession {
        &self.session
    }

    pub fn into_session(self) -> SubFileIoSession {
        self.session
    }

    pub fn is_read_only(&self) -> bool {
        self.session.is_read_only()
    }

    pub fn remaining_supported_io_sessions(&self) -> usize {
        usize::MAX
    }

    /// Forget the current block mapping; the next access maps again.
    pub fn flush(&mut self) {
        self.current = None;
    }

    fn map(&mut self, writing: bool) -> Result<BlockArgs> {
        if let Some(args) = self.current {
            let reusable = args.contains(self.position)
                && (!writing || args.supports_writing)
                && !self.session.is_mapping_stale();
            if reusable {
                return Ok(args);
            }
        }
        self.current = None;
        let args = self.session.get_block(self.position, writing)?;
        self.current = Some(args);
        Ok(args)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let args = self.map(false)?;
            let offset = (self.position - args.first_position) as usize;
            let n = (args.length - offset).min(buf.len() - done);
            self.session.read_at(offset, &mut buf[done..done + n])?;
            done += n;
            self.position += n as i64;
        }
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let args = self.map(true)?;
            let offset = (self.position - args.first_position) as usize;
            let n = (args.length - offset).min(data.len() - done);
            self.session.write_at(offset, &data[done..done + n])?;
            done += n;
            self.position += n as i64;
        }
        Ok(())
    }

    le_accessors! {
        read_u16, write_u16, u16;
        read_u32, write_u32, u32;
        read_u64, write_u64, u64;
        read_i16, write_i16, i16;
        read_i32, write_i32, i32;
        read_i64, write_i64, i64;
        read_f32, write_f32, f32;
        read_f64, write_f64, f64;
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Write `value` seven bits at a time, low bits first; the high bit of
    /// each byte flags a continuation.
    pub fn write_7bit_u64(&mut self, mut value: u64) -> Result<()> {
        let mut buf = [0u8; MAX_7BIT_U64_LEN];
        let mut len = 0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                buf[len] = byte;
                len += 1;
                break;
            }
            buf[len] = byte | 0x80;
            len += 1;
        }
        self.write_all(&buf[..len])
    }

    pub fn read_7bit_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_7BIT_U64_LEN {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(HistError::InvalidArgument(
            "7-bit encoded integer is longer than 10 bytes".to_string(),
        ))
    }

    pub fn write_7bit_u32(&mut self, value: u32) -> Result<()> {
        self.write_7bit_u64(value as u64)
    }

    pub fn read_7bit_u32(&mut self) -> Result<u32> {
        let value = self.read_7bit_u64()?;
        u32::try_from(value).map_err(|_| {
            HistError::InvalidArgument(format!("7-bit encoded value {} does not fit a u32", value))
        })
    }

    /// 7-bit length prefix followed by UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_7bit_u64(value.len() as u64)?;
        self.write_all(value.as_bytes())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_7bit_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| HistError::InvalidArgument(format!("string length {} is too large", len)))?;
        let mut bytes = Vec::with_capacity(len.min(STRING_CHUNK));
        let mut chunk = [0u8; STRING_CHUNK];
        let mut left = len;
        while left > 0 {
            let n = left.min(STRING_CHUNK);
            self.read_exact(&mut chunk[..n])?;
            bytes.extend_from_slice(&chunk[..n]);
            left -= n;
        }
        String::from_utf8(bytes)
            .map_err(|e| HistError::InvalidArgument(format!("string is not UTF-8: {}", e)))
    }

    /// Copy `len` bytes from `source` to `dest`. The ranges may overlap. The
    /// position is left unchanged.
    pub fn copy_within(&mut self, source: i64, dest: i64, len: usize) -> Result<()> {
        if len == 0 || source == dest {
            return Ok(());
        }
        let saved = self.position;
        let mut bytes = vec![0u8; len];
        self.position = source;
        let copied = self.read_exact(&mut bytes).and_then(|()| {
            self.position = dest;
            self.write_all(&bytes)
        });
        self.position = saved;
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SubFileName;
    use crate::options::FileStructureOptions;
    use crate::page_pool::PagePool;
    use crate::sub_file_stream::BinarySessionFactory;
    use crate::transaction::InMemoryFileStructure;

    fn structure() -> InMemoryFileStructure {
        let options = FileStructureOptions {
            page_pool: Some(PagePool::new(128).unwrap()),
            ..FileStructureOptions::with_block_size(128)
        };
        InMemoryFileStructure::create_in_memory(options).unwrap()
    }

    #[test]
    fn test_typed_values_across_block_boundaries() {
        let fs = structure();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.create_file(SubFileName::from_label("typed")).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();

        // 96 usable bytes per block; start close to the first boundary.
        bs.set_position(93);
        bs.write_u64(0x0102_0304_0506_0708).unwrap();
        bs.write_i32(-5).unwrap();
        bs.write_f64(2.5).unwrap();
        bs.write_bool(true).unwrap();
        bs.write_7bit_u32(300).unwrap();
        bs.write_7bit_u64(u64::MAX).unwrap();
        bs.write_string("historian").unwrap();
        bs.write_i16(-2).unwrap();
        let end = bs.position();

        bs.set_position(93);
        assert_eq!(bs.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(bs.read_i32().unwrap(), -5);
        assert_eq!(bs.read_f64().unwrap(), 2.5);
        assert!(bs.read_bool().unwrap());
        assert_eq!(bs.read_7bit_u32().unwrap(), 300);
        assert_eq!(bs.read_7bit_u64().unwrap(), u64::MAX);
        assert_eq!(bs.read_string().unwrap(), "historian");
        assert_eq!(bs.read_i16().unwrap(), -2);
        assert_eq!(bs.position(), end);
    }

    #[test]
    fn test_seven_bit_lengths() {
        let fs = structure();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.create_file(SubFileName::random()).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        bs.write_7bit_u32(127).unwrap();
        assert_eq!(bs.position(), 1);
        bs.write_7bit_u32(128).unwrap();
        assert_eq!(bs.position(), 3);
        bs.write_7bit_u64(u64::MAX).unwrap();
        assert_eq!(bs.position(), 13);
    }

    #[test]
    fn test_damaged_string_length_is_an_error() {
        let fs = structure();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.create_file(SubFileName::random()).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        bs.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).unwrap();

        bs.set_position(0);
        assert!(matches!(
            bs.read_string(),
            Err(HistError::MissingBlock { virtual_block: 1 })
        ));

        // Eleven continuation bytes are rejected before any length is used.
        bs.set_position(0);
        bs.write_all(&[0x80; 11]).unwrap();
        bs.set_position(0);
        assert!(matches!(bs.read_string(), Err(HistError::InvalidArgument(_))));
    }

    #[test]
    fn test_copy_within_overlapping() {
        let fs = structure();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.create_file(SubFileName::random()).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        bs.write_all(&data).unwrap();
        bs.copy_within(0, 50, 200).unwrap();
        assert_eq!(bs.position(), 250);

        bs.set_position(50);
        let mut back = vec![0u8; 200];
        bs.read_exact(&mut back).unwrap();
        assert_eq!(back, data[..200]);
    }

    #[test]
    fn test_read_only_stream_rejects_writes() {
        let fs = structure();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.create_file(SubFileName::from_label("ro")).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        bs.write_u32(11).unwrap();
        drop(bs);
        drop(stream);
        edit.commit().unwrap();

        let snapshot = fs.snapshot().unwrap();
        let stream = snapshot.open_file(0).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        assert!(bs.is_read_only());
        assert_eq!(bs.read_u32().unwrap(), 11);
        bs.set_position(0);
        assert!(matches!(bs.write_u32(12), Err(HistError::ReadOnly(_))));
    }
}
