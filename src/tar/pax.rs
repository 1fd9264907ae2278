//! PAX extended header records: `"<len> <key>=<value>\n"`, where `<len>`
//! counts itself. Used here only for the `path` key (long names); other
//! keys present in a foreign archive are parsed but ignored.

use std::collections::BTreeMap;

pub fn encode_record(key: &str, value: &str) -> Vec<u8> {
    // len is self-referential: grow a candidate length until it's stable.
    let suffix = format!(" {}={}\n", key, value);
    let mut len = suffix.len() + 1;
    loop {
        let candidate = format!("{}{}", len, suffix);
        if candidate.len() == len {
            return candidate.into_bytes();
        }
        len = candidate.len();
    }
}

pub fn decode_records(payload: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let text = match std::str::from_utf8(rest) {
            Ok(t) => t,
            Err(_) => break,
        };
        let space_idx = match text.find(' ') {
            Some(i) => i,
            None => break,
        };
        let len: usize = match text[..space_idx].parse() {
            Ok(n) => n,
            Err(_) => break,
        };
        if len == 0 || len > rest.len() {
            break;
        }
        let record = &text[space_idx + 1..len];
        if let Some(eq) = record.find('=') {
            let key = record[..eq].to_string();
            let value = record[eq + 1..].trim_end_matches('\n').to_string();
            out.insert(key, value);
        }
        rest = &rest[len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_recovers_long_path() {
        let long_name = "a/".repeat(60) + "file.txt";
        let record = encode_record("path", &long_name);
        let decoded = decode_records(&record);
        assert_eq!(decoded.get("path"), Some(&long_name));
    }

    #[test]
    fn length_prefix_is_self_inclusive() {
        let record = encode_record("path", "x");
        let text = std::str::from_utf8(&record).unwrap();
        let space = text.find(' ').unwrap();
        let len: usize = text[..space].parse().unwrap();
        assert_eq!(len, record.len());
    }
}
