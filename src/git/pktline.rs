//! Git pkt-line framing: a 4-byte hex length header (`0000` = flush),
//! followed by the payload.

use std::io::Read;

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Data(Vec<u8>),
}

/// Encodes one data pkt-line. The length field counts itself (4 bytes) plus
/// the payload.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let len = data.len() + 4;
    let mut out = format!("{:04x}", len).into_bytes();
    out.extend_from_slice(data);
    out
}

pub fn encode_flush() -> Vec<u8> {
    b"0000".to_vec()
}

/// Decodes a single pkt-line from the front of `bytes`, returning the line
/// and the number of bytes consumed.
pub fn decode_one(bytes: &[u8]) -> Result<(PktLine, usize), GitError> {
    if bytes.len() < 4 {
        return Err(GitError::BadPktLineLength(format!("{:?}", bytes)));
    }
    let len_str = std::str::from_utf8(&bytes[0..4])
        .map_err(|_| GitError::BadPktLineLength(format!("{:?}", &bytes[0..4])))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| GitError::BadPktLineLength(len_str.to_string()))?;

    if len == 0 {
        return Ok((PktLine::Flush, 4));
    }
    if len < 4 {
        return Err(GitError::BadPktLineLength(len_str.to_string()));
    }
    if bytes.len() < len {
        return Err(GitError::BadPktLineLength(format!(
            "declared length {} exceeds available {} bytes",
            len,
            bytes.len()
        )));
    }
    Ok((PktLine::Data(bytes[4..len].to_vec()), len))
}

/// Decodes every pkt-line in `bytes` up to (and including) the first flush,
/// or to the end of the buffer if none appears.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<PktLine>, GitError> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (line, consumed) = decode_one(rest)?;
        let is_flush = matches!(line, PktLine::Flush);
        out.push(line);
        rest = &rest[consumed..];
        if is_flush {
            break;
        }
    }
    Ok(out)
}

pub fn read_one<R: Read>(reader: &mut R) -> Result<PktLine, GitError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| GitError::BadPktLineLength(e.to_string()))?;
    let len_str = std::str::from_utf8(&len_buf).map_err(|_| GitError::BadPktLineLength(format!("{:?}", len_buf)))?;
    let len = usize::from_str_radix(len_str, 16).map_err(|_| GitError::BadPktLineLength(len_str.to_string()))?;
    if len == 0 {
        return Ok(PktLine::Flush);
    }
    if len < 4 {
        return Err(GitError::BadPktLineLength(len_str.to_string()));
    }
    let mut payload = vec![0u8; len - 4];
    reader
        .read_exact(&mut payload)
        .map_err(|e| GitError::BadPktLineLength(e.to_string()))?;
    Ok(PktLine::Data(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_payloads() {
        for payload in [&b""[..], b"hello", b"want deadbeef\n"] {
            let encoded = encode(payload);
            let (decoded, consumed) = decode_one(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, PktLine::Data(payload.to_vec()));
        }
    }

    #[test]
    fn flush_decodes_to_empty_marker() {
        let (line, consumed) = decode_one(b"0000rest").unwrap();
        assert_eq!(line, PktLine::Flush);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn malformed_length_raises() {
        assert!(decode_one(b"zzzzrest").is_err());
        assert!(decode_one(b"000").is_err());
    }

    #[test]
    fn decode_all_stops_after_first_flush() {
        let mut bytes = encode(b"a");
        bytes.extend(encode(b"b"));
        bytes.extend(encode_flush());
        bytes.extend(encode(b"c"));
        let lines = decode_all(&bytes).unwrap();
        assert_eq!(lines, vec![
            PktLine::Data(b"a".to_vec()),
            PktLine::Data(b"b".to_vec()),
            PktLine::Flush,
        ]);
    }
}
