//! The snapshot archive format: a tar stream, optionally gzip-wrapped.
//!
//! Every key/value pair becomes one regular-file entry whose name is the key
//! bytes verbatim and whose body is the value. Keys longer than the 100-byte
//! tar name field are carried in a preceding GNU long-name entry.
//!
//! The encoder is synchronous and buffers at most one entry: callers append
//! an entry, then drain the produced bytes into an async pipe. The decoder
//! runs over any blocking [`Read`] and detects gzip from the magic bytes.

use std::io::{self, BufRead, BufReader, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{EntryType, Header};

use vcp_core::error::VcpError;
use vcp_core::types::KeyValueRecord;
use vcp_core::Result;

/// Gzip level used for snapshots: fast, since snapshots run against a live store.
pub const COMPRESSION_LEVEL: u32 = 3;

/// Mode bits of every archive entry.
pub const ENTRY_MODE: u32 = 0o666;

const NAME_FIELD_LEN: usize = 100;
/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_ENTRY_PREALLOC: u64 = 1 << 20;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LONG_NAME_ENTRY: &[u8] = b"././@LongLink";

enum ArchiveBuffer {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
}

impl ArchiveBuffer {
    /// Take the bytes produced so far.
    fn take(&mut self) -> Vec<u8> {
        match self {
            ArchiveBuffer::Plain(buf) => std::mem::take(buf),
            ArchiveBuffer::Gzip(encoder) => std::mem::take(encoder.get_mut()),
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            ArchiveBuffer::Plain(buf) => Ok(buf),
            ArchiveBuffer::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl Write for ArchiveBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveBuffer::Plain(buf) => buf.write(data),
            ArchiveBuffer::Gzip(encoder) => encoder.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveBuffer::Plain(_) => Ok(()),
            ArchiveBuffer::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Incremental archive writer.
pub struct ArchiveEncoder {
    builder: tar::Builder<ArchiveBuffer>,
    entries: u64,
}

impl ArchiveEncoder {
    /// Create an encoder, gzip-compressing the output if `compress` is set.
    pub fn new(compress: bool) -> Self {
        let buffer = if compress {
            ArchiveBuffer::Gzip(GzEncoder::new(
                Vec::new(),
                Compression::new(COMPRESSION_LEVEL),
            ))
        } else {
            ArchiveBuffer::Plain(Vec::new())
        };
        Self {
            builder: tar::Builder::new(buffer),
            entries: 0,
        }
    }

    /// Append one entry and return the archive bytes now ready to be sent.
    ///
    /// With compression on the returned chunk may be empty; the compressor
    /// holds data back until it has a full block.
    pub fn append(&mut self, name: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if name.is_empty() {
            return Err(VcpError::archive_msg("archive entry name must not be empty"));
        }
        let key = String::from_utf8_lossy(name);

        if name.len() > NAME_FIELD_LEN {
            let mut long_name = name.to_vec();
            long_name.push(0);
            let header = entry_header(LONG_NAME_ENTRY, long_name.len() as u64, EntryType::GNULongName);
            self.builder
                .append(&header, long_name.as_slice())
                .map_err(|e| VcpError::archive(format!("write long name entry for {key}"), e))?;
        }

        let header = entry_header(name, data.len() as u64, EntryType::Regular);
        self.builder
            .append(&header, data)
            .map_err(|e| VcpError::archive(format!("write archive entry {key}"), e))?;
        self.entries += 1;

        Ok(self.builder.get_mut().take())
    }

    /// Number of entries appended so far (long-name entries not counted).
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Write the end-of-archive marker, finish compression, and return the
    /// remaining bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        let buffer = self
            .builder
            .into_inner()
            .map_err(|e| VcpError::archive("write end of archive", e))?;
        buffer
            .finish()
            .map_err(|e| VcpError::archive("finish compressed stream", e))
    }
}

fn entry_header(name: &[u8], size: u64, kind: EntryType) -> Header {
    let mut header = Header::new_gnu();
    let len = name.len().min(NAME_FIELD_LEN);
    header.as_old_mut().name[..len].copy_from_slice(&name[..len]);
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_entry_type(kind);
    header.set_mtime(0);
    header.set_cksum();
    header
}

/// Wrap `reader` in a gzip decoder if the stream starts with the gzip magic.
pub fn maybe_decompress<R: Read + Send + 'static>(reader: R) -> Result<Box<dyn Read + Send>> {
    let mut reader = BufReader::new(reader);
    let head = reader
        .fill_buf()
        .map_err(|e| VcpError::archive("read archive header", e))?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Decode entries from `reader`, handing each to `on_entry` in archive order.
///
/// Stops at the end-of-archive marker or at the first entry with an empty
/// name. `on_entry` returns `Ok(false)` to stop early. Returns the number of
/// entries delivered.
pub fn decode<R, F>(reader: R, mut on_entry: F) -> Result<u64>
where
    R: Read + Send + 'static,
    F: FnMut(KeyValueRecord) -> Result<bool>,
{
    let mut archive = tar::Archive::new(maybe_decompress(reader)?);
    let entries = archive
        .entries()
        .map_err(|e| VcpError::archive("read archive", e))?;

    let mut delivered = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| VcpError::archive("read archive entry", e))?;
        let key = entry.path_bytes().into_owned();
        if key.is_empty() {
            break;
        }

        // The header size is untrusted until the body has actually been read.
        let size = entry.size();
        let mut data = Vec::with_capacity(size.min(MAX_ENTRY_PREALLOC) as usize);
        entry.by_ref().take(size).read_to_end(&mut data).map_err(|e| {
            VcpError::archive(
                format!("read archive entry {}", String::from_utf8_lossy(&key)),
                e,
            )
        })?;
        if data.len() as u64 != size {
            return Err(VcpError::archive_msg(format!(
                "unexpected end of archive in entry {}: expected {size} bytes, got {}",
                String::from_utf8_lossy(&key),
                data.len()
            )));
        }

        delivered += 1;
        if !on_entry(KeyValueRecord { key, data })? {
            break;
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(records: &[(&[u8], &[u8])], compress: bool) -> Vec<u8> {
        let mut encoder = ArchiveEncoder::new(compress);
        let mut out = Vec::new();
        for (key, value) in records {
            out.extend(encoder.append(key, value).unwrap());
        }
        out.extend(encoder.finish().unwrap());
        out
    }

    fn decode_all(bytes: Vec<u8>) -> Vec<KeyValueRecord> {
        let mut records = Vec::new();
        decode(Cursor::new(bytes), |record| {
            records.push(record);
            Ok(true)
        })
        .unwrap();
        records
    }

    #[test]
    fn test_plain_archive_is_standard_tar() {
        let bytes = encode(&[(b"/registry/pods/default/web", b"pod")], false);
        assert_eq!(bytes.len() % 512, 0);

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let mut entries = archive.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(&*entry.path_bytes(), b"/registry/pods/default/web");
        assert_eq!(entry.header().mode().unwrap(), 0o666);
        assert_eq!(entry.header().entry_type(), EntryType::Regular);
        assert_eq!(entry.size(), 3);
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_compressed_archive_has_gzip_magic() {
        let bytes = encode(&[(b"/a", b"1")], true);
        assert_eq!(&bytes[..2], &GZIP_MAGIC);
        let records = decode_all(bytes);
        assert_eq!(records, vec![KeyValueRecord::new("/a", "1")]);
    }

    #[test]
    fn test_long_and_binary_keys() {
        let long_key = format!("/registry/configmaps/{}", "x".repeat(200));
        let binary_key: &[u8] = &[b'/', 0xff, 0xfe, b'k'];
        let exact_key = format!("/{}", "y".repeat(99));
        let bytes = encode(
            &[
                (long_key.as_bytes(), b"long"),
                (binary_key, b"binary"),
                (exact_key.as_bytes(), b""),
            ],
            false,
        );
        let records = decode_all(bytes);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, long_key.as_bytes());
        assert_eq!(records[0].data, b"long");
        assert_eq!(records[1].key, binary_key);
        assert_eq!(records[2].key, exact_key.as_bytes());
        assert!(records[2].data.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut encoder = ArchiveEncoder::new(false);
        assert!(matches!(
            encoder.append(b"", b"value"),
            Err(VcpError::Archive { .. })
        ));
    }

    #[test]
    fn test_decode_stops_on_request() {
        let bytes = encode(&[(b"/a", b"1"), (b"/b", b"2"), (b"/c", b"3")], true);
        let mut seen = 0;
        let delivered = decode(Cursor::new(bytes), |_| {
            seen += 1;
            Ok(seen < 2)
        })
        .unwrap();
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_decode_truncated_archive_fails() {
        let mut bytes = encode(&[(b"/a", &[1u8; 2048]), (b"/b", b"2")], false);
        bytes.truncate(700);
        let result = decode(Cursor::new(bytes), |_| Ok(true));
        assert!(matches!(result, Err(VcpError::Archive { .. })));
    }

    #[test]
    fn test_decode_oversized_declared_size_fails() {
        for declared in [1u64 << 40, 1u64 << 63] {
            let mut encoder = ArchiveEncoder::new(false);
            let mut bytes = encoder.append(b"/a", b"1").unwrap();
            let header = entry_header(b"/b", declared, EntryType::Regular);
            bytes.extend_from_slice(header.as_bytes());
            bytes.extend_from_slice(&[7u8; 512]);

            let mut keys = Vec::new();
            let result = decode(Cursor::new(bytes), |record| {
                keys.push(record.key);
                Ok(true)
            });
            assert!(matches!(result, Err(VcpError::Archive { .. })), "{declared}: {result:?}");
            assert_eq!(keys, vec![b"/a".to_vec()]);
        }
    }

    #[test]
    fn test_decode_empty_stream() {
        let delivered = decode(Cursor::new(Vec::new()), |_| Ok(true)).unwrap();
        assert_eq!(delivered, 0);
    }
}
