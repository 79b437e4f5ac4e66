use crate::error::{BakError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Separator written after each header entry.
pub const FIELD_SEPARATOR: u8 = 0x1E;
/// Replaces the final separator, marking the end of the header.
pub const HEADER_TERMINATOR: u8 = 0x1D;

/// One entry of a block header: the byte range and the base name of
/// the client file it came from. The caller resolves file ids to
/// names before encoding; an id that cannot be resolved is an
/// internal-consistency error, never a user error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub start: u64,
    pub stop: u64,
    pub file_name: String,
}

/// Encodes the block header: per entry `start` and `stop` as 8-byte
/// big-endian integers, the UTF-8 file base name, and a separator
/// byte; the final separator is replaced by the terminator.
pub fn encode_header(entries: &[HeaderEntry]) -> Result<Vec<u8>> {
    if entries.is_empty() {
        return Err(BakError::InvariantViolation(
            "block header must reference at least one file range".to_string(),
        ));
    }

    let mut header = Vec::new();
    for entry in entries {
        if entry.start >= entry.stop {
            return Err(BakError::InvariantViolation(format!(
                "invalid file range {}..{}",
                entry.start, entry.stop
            )));
        }
        header.extend_from_slice(&entry.start.to_be_bytes());
        header.extend_from_slice(&entry.stop.to_be_bytes());
        header.extend_from_slice(entry.file_name.as_bytes());
        header.push(FIELD_SEPARATOR);
    }
    *header.last_mut().unwrap() = HEADER_TERMINATOR;

    Ok(header)
}

/// Decodes a header produced by [`encode_header`]. Returns the
/// entries and the number of bytes consumed (terminator included).
pub fn decode_header(bytes: &[u8]) -> Result<(Vec<HeaderEntry>, usize)> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    loop {
        if bytes.len() < pos + 16 {
            return Err(BakError::InvariantViolation(
                "truncated block header".to_string(),
            ));
        }
        let start = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let stop = u64::from_be_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
        pos += 16;

        let name_start = pos;
        let (name_end, terminated) = loop {
            match bytes.get(pos) {
                Some(&FIELD_SEPARATOR) => break (pos, false),
                Some(&HEADER_TERMINATOR) => break (pos, true),
                Some(_) => pos += 1,
                None => {
                    return Err(BakError::InvariantViolation(
                        "unterminated block header".to_string(),
                    ))
                }
            }
        };
        let file_name = std::str::from_utf8(&bytes[name_start..name_end])
            .map_err(|_| BakError::InvariantViolation("header file name not UTF-8".to_string()))?
            .to_string();
        pos = name_end + 1;

        entries.push(HeaderEntry {
            start,
            stop,
            file_name,
        });

        if terminated {
            return Ok((entries, pos));
        }
    }
}

/// Assembles the canonical block payload: `header ‖ concat(fragments)
/// ‖ zero padding`, exactly `block_size` bytes. These are the bytes
/// both hashed and transferred; they must never diverge.
pub fn assemble_block(block_size: u64, header: &[u8], fragments: &[Bytes]) -> Result<Bytes> {
    let data_len: usize = fragments.iter().map(|fragment| fragment.len()).sum();
    let used = header.len() + data_len;
    if used as u64 > block_size {
        return Err(BakError::InvariantViolation(format!(
            "block content of {} bytes exceeds block size {}",
            used, block_size
        )));
    }

    let mut payload = BytesMut::with_capacity(block_size as usize);
    payload.put_slice(header);
    for fragment in fragments {
        payload.put_slice(fragment);
    }
    payload.resize(block_size as usize, 0);

    Ok(payload.freeze())
}

/// Splits a newly uploaded file of `file_size` bytes into consecutive
/// `(start, stop)` ranges of `block_size - header_size` bytes each,
/// the last one shortened to fit. A zero-length file yields no
/// ranges.
pub fn compute_new_block_boundaries(
    file_size: u64,
    header_size: u64,
    block_size: u64,
) -> Result<Vec<(u64, u64)>> {
    if header_size >= block_size {
        return Err(BakError::InvariantViolation(format!(
            "header of {} bytes leaves no room in {}-byte blocks",
            header_size, block_size
        )));
    }

    let data_capacity = block_size - header_size;
    let mut boundaries = Vec::new();
    let mut start = 0u64;
    while start < file_size {
        let stop = (start + data_capacity).min(file_size);
        boundaries.push((start, stop));
        start = stop;
    }

    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, stop: u64, name: &str) -> HeaderEntry {
        HeaderEntry {
            start,
            stop,
            file_name: name.to_string(),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let entries = vec![
            entry(0, 4096, "photo.jpg"),
            entry(4096, 5000, "notes.txt"),
            entry(17, 18, "x"),
        ];
        let encoded = encode_header(&entries).unwrap();
        assert_eq!(*encoded.last().unwrap(), HEADER_TERMINATOR);

        let (decoded, consumed) = decode_header(&encoded).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_header_size_is_fixed_width_plus_name() {
        let encoded = encode_header(&[entry(0, 10, "abc")]).unwrap();
        // 8 + 8 byte offsets, 3 byte name, 1 terminator
        assert_eq!(encoded.len(), 20);
    }

    #[test]
    fn test_empty_header_rejected() {
        assert!(encode_header(&[]).is_err());
    }

    #[test]
    fn test_invalid_range_rejected() {
        assert!(encode_header(&[entry(5, 5, "a")]).is_err());
        assert!(encode_header(&[entry(6, 5, "a")]).is_err());
    }

    #[test]
    fn test_assemble_block_is_exactly_block_size() {
        let header = encode_header(&[entry(0, 5, "f")]).unwrap();
        let payload = assemble_block(64, &header, &[Bytes::from_static(b"hello")]).unwrap();
        assert_eq!(payload.len(), 64);
        assert_eq!(&payload[..header.len()], &header[..]);
        assert_eq!(&payload[header.len()..header.len() + 5], b"hello");
        assert!(payload[header.len() + 5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_assemble_block_overflow_rejected() {
        let header = encode_header(&[entry(0, 100, "f")]).unwrap();
        let data = Bytes::from(vec![7u8; 100]);
        assert!(assemble_block(64, &header, &[data]).is_err());
    }

    #[test]
    fn test_boundaries_cover_file_without_gaps() {
        let boundaries = compute_new_block_boundaries(1000, 24, 256).unwrap();
        // capacity 232 per block, ceil(1000/232) = 5
        assert_eq!(boundaries.len(), 5);
        assert_eq!(boundaries.first().unwrap().0, 0);
        assert_eq!(boundaries.last().unwrap().1, 1000);
        for window in boundaries.windows(2) {
            assert_eq!(window[0].1, window[1].0);
        }
        for (start, stop) in &boundaries {
            assert!(stop - start <= 232);
        }
    }

    #[test]
    fn test_boundaries_exact_multiple() {
        let boundaries = compute_new_block_boundaries(464, 24, 256).unwrap();
        assert_eq!(boundaries, vec![(0, 232), (232, 464)]);
    }

    #[test]
    fn test_boundaries_empty_file() {
        assert!(compute_new_block_boundaries(0, 24, 256)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_boundaries_header_too_large() {
        assert!(compute_new_block_boundaries(10, 256, 256).is_err());
    }
}
