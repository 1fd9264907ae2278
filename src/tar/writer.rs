//! Gzipped POSIX ustar writer.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::error::TarError;
use super::header::{self, UstarHeader, BLOCK_SIZE};
use super::pax;

const NAME_FIELD_LIMIT: usize = 99;

pub fn write_tar_gz(src_dir: &Path, output_path: &Path) -> Result<(), TarError> {
    let file = fs::File::create(output_path).map_err(|e| TarError::BadHeader {
        reason: format!("creating {}: {}", output_path.display(), e),
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut writer = std::io::BufWriter::new(encoder);
    write_tar(src_dir, &mut writer)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

pub fn write_tar<W: Write>(src_dir: &Path, writer: &mut W) -> Result<(), TarError> {
    let mut entries: Vec<_> = WalkDir::new(src_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let path = entry.path();
        let rel = path
            .strip_prefix(src_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = fs::symlink_metadata(path).map_err(io_err)?;
        let mtime = metadata.mtime();
        let mode = metadata.permissions().mode() & 0o7777;

        if metadata.is_dir() {
            write_header_entry(writer, &format!("{}/", rel), "", header::TYPE_DIRECTORY, mode, mtime as i64, 0)?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(path).map_err(io_err)?;
            let target = target.to_string_lossy().to_string();
            write_header_entry(writer, &rel, &target, header::TYPE_SYMLINK, mode, mtime as i64, 0)?;
        } else {
            let content = fs::read(path).map_err(io_err)?;
            write_header_entry(writer, &rel, "", header::TYPE_REGULAR, mode, mtime as i64, content.len() as u64)?;
            write_padded(writer, &content)?;
        }
    }

    // two zero blocks terminate the archive
    writer.write_all(&[0u8; BLOCK_SIZE * 2]).map_err(io_err)?;
    Ok(())
}

fn write_header_entry<W: Write>(
    writer: &mut W,
    name: &str,
    linkname: &str,
    typeflag: u8,
    mode: u32,
    mtime: i64,
    size: u64,
) -> Result<(), TarError> {
    let name_fits = name.len() <= NAME_FIELD_LIMIT;
    let linkname_fits = linkname.len() <= NAME_FIELD_LIMIT;

    if !name_fits || !linkname_fits {
        write_pax_header(writer, name, linkname)?;
    }

    let stored_name = if name_fits { name.to_string() } else { fallback_name(name)? };
    let stored_linkname = if linkname_fits { linkname.to_string() } else { fallback_name(linkname)? };

    let header = UstarHeader {
        name: stored_name,
        prefix: String::new(),
        mode,
        uid: 0,
        gid: 0,
        size,
        mtime,
        typeflag,
        linkname: stored_linkname,
    };
    let block = header.serialize()?;
    writer.write_all(&block).map_err(io_err)?;
    Ok(())
}

fn write_pax_header<W: Write>(writer: &mut W, name: &str, linkname: &str) -> Result<(), TarError> {
    let mut payload = Vec::new();
    if name.len() > NAME_FIELD_LIMIT {
        payload.extend(pax::encode_record("path", name));
    }
    if linkname.len() > NAME_FIELD_LIMIT {
        payload.extend(pax::encode_record("linkpath", linkname));
    }

    let pax_name = fallback_name(&format!("PaxHeaders/{}", name))?;
    let pax_header = UstarHeader {
        name: pax_name,
        prefix: String::new(),
        mode: 0o644,
        uid: 0,
        gid: 0,
        size: payload.len() as u64,
        mtime: 0,
        typeflag: header::TYPE_PAX_EXTENDED,
        linkname: String::new(),
    };
    writer.write_all(&pax_header.serialize()?).map_err(io_err)?;
    write_padded(writer, &payload)?;
    Ok(())
}

fn write_padded<W: Write>(writer: &mut W, content: &[u8]) -> Result<(), TarError> {
    writer.write_all(content).map_err(io_err)?;
    let remainder = content.len() % BLOCK_SIZE;
    if remainder != 0 {
        let pad = BLOCK_SIZE - remainder;
        writer.write_all(&vec![0u8; pad]).map_err(io_err)?;
    }
    Ok(())
}

/// A still-unique ustar `name` field for an entry whose real name was
/// recorded in a PAX header: `<crc32-of-full-name>_<tail-of-basename>`,
/// truncated to fit the 99-byte budget.
fn fallback_name(full: &str) -> Result<String, TarError> {
    let crc = crc32fast::hash(full.as_bytes());
    let hash_prefix = format!("{:08x}_", crc);
    if hash_prefix.len() >= NAME_FIELD_LIMIT {
        return Err(TarError::LongPath { name: full.to_string() });
    }
    let budget = NAME_FIELD_LIMIT - hash_prefix.len();
    let basename = full.trim_end_matches('/').rsplit('/').next().unwrap_or(full);
    let tail = take_last_chars_fitting(basename, budget);
    let candidate = format!("{}{}", hash_prefix, tail);
    if candidate.len() > NAME_FIELD_LIMIT || candidate.is_empty() {
        return Err(TarError::LongPath { name: full.to_string() });
    }
    Ok(candidate)
}

fn take_last_chars_fitting(s: &str, budget: usize) -> String {
    if s.len() <= budget {
        return s.to_string();
    }
    let mut start = s.len() - budget;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

fn io_err(e: std::io::Error) -> TarError {
    TarError::BadHeader { reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_name_stays_under_limit_for_absurdly_long_names() {
        let long = "a".repeat(500);
        let name = fallback_name(&long).unwrap();
        assert!(name.len() <= NAME_FIELD_LIMIT);
    }

    #[test]
    fn fallback_names_differ_for_different_full_paths() {
        let a = fallback_name(&format!("{}/one.txt", "x".repeat(200))).unwrap();
        let b = fallback_name(&format!("{}/two.txt", "x".repeat(200))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn write_tar_of_small_tree_round_trips_via_reader() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/file.txt"), b"hello").unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let archive = out_dir.path().join("t.tar.gz");
        write_tar_gz(src.path(), &archive).unwrap();
        assert!(archive.exists());

        let dest = tempfile::tempdir().unwrap();
        super::super::reader::extract_tar_gz(&archive, dest.path(), &super::super::reader::ExtractOptions::default()).unwrap();
        let extracted = fs::read(dest.path().join("sub/file.txt")).unwrap();
        assert_eq!(extracted, b"hello");
    }
}
