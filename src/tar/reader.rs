//! POSIX ustar (optionally gzipped) extractor.
//!
//! `.tar.xz`/`.tar.bz2` defer to the host `tar` binary rather than
//! reimplementing those compression formats; `.tar.gz`/`.tar` are decoded
//! internally.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::TarError;
use crate::process::Cmd;
use super::header::{self, UstarHeader, BLOCK_SIZE};
use super::pax;

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub preserve_ownership: bool,
    pub uid_override: Option<u32>,
    pub gid_override: Option<u32>,
    /// Force the host `tar` binary even for `.tar`/`.tar.gz`.
    pub use_system_tar: bool,
}

/// Normalizes a raw tar entry name and rejects anything unsafe (absolute,
/// `..` components, empty after `./` stripping). Returns `None` for entries
/// that must be skipped-with-a-warning rather than extracted.
fn normalize_entry_name(raw: &str) -> Option<PathBuf> {
    let stripped = raw.strip_prefix("./").unwrap_or(raw);
    if stripped.is_empty() {
        return None;
    }
    let path = Path::new(stripped);
    if path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

pub fn extract_archive(archive: &Path, dest: &Path, opts: &ExtractOptions) -> Result<()> {
    let name = archive.to_string_lossy();
    if opts.use_system_tar || name.ends_with(".tar.xz") || name.ends_with(".tar.bz2") {
        return extract_with_system_tar(archive, dest);
    }
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return extract_tar_gz(archive, dest, opts);
    }
    if name.ends_with(".tar") {
        let file = fs::File::open(archive)
            .with_context(|| format!("opening {}", archive.display()))?;
        return extract_stream(file, dest, opts).map_err(Into::into);
    }
    bail!("unrecognized archive extension: {}", archive.display());
}

pub fn extract_tar_gz(archive: &Path, dest: &Path, opts: &ExtractOptions) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("opening {}", archive.display()))?;
    let decoder = GzDecoder::new(file);
    extract_stream(decoder, dest, opts).map_err(Into::into)
}

fn extract_with_system_tar(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    Cmd::new("tar")
        .arg("-xf")
        .arg_path(archive)
        .arg("-C")
        .arg_path(dest)
        .error_msg("host tar extraction failed")
        .run()?;
    Ok(())
}

struct PendingDirMtime {
    path: PathBuf,
    mtime: i64,
}

pub fn extract_stream<R: Read>(mut reader: R, dest: &Path, opts: &ExtractOptions) -> Result<(), TarError> {
    fs::create_dir_all(dest).map_err(io_err)?;

    let mut pending_long_name: Option<String> = None;
    let mut pending_long_link: Option<String> = None;
    let mut dir_mtimes: Vec<PendingDirMtime> = Vec::new();

    loop {
        let mut block = [0u8; BLOCK_SIZE];
        match read_full(&mut reader, &mut block) {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial => {
                return Err(TarError::Extraction { name: "<stream>".to_string() });
            }
            ReadOutcome::Ok => {}
        }

        if UstarHeader::is_zero_block(&block) {
            break;
        }

        let header = UstarHeader::parse(&block)?;
        let padded_size = pad_up(header.size as usize);

        match header.typeflag {
            header::TYPE_GNU_LONGNAME => {
                let data = read_exact_payload(&mut reader, header.size as usize, padded_size)?;
                pending_long_name = Some(trim_nul(&data));
                continue;
            }
            header::TYPE_PAX_EXTENDED => {
                let data = read_exact_payload(&mut reader, header.size as usize, padded_size)?;
                let records: BTreeMap<String, String> = pax::decode_records(&data);
                if let Some(p) = records.get("path") {
                    pending_long_name = Some(p.clone());
                }
                if let Some(p) = records.get("linkpath") {
                    pending_long_link = Some(p.clone());
                }
                continue;
            }
            _ => {}
        }

        let effective_name = pending_long_name.take().unwrap_or_else(|| header.full_name());
        let effective_link = pending_long_link.take().unwrap_or_else(|| header.linkname.clone());

        let rel = match normalize_entry_name(&effective_name) {
            Some(p) => p,
            None => {
                warn!("Skipping unsafe tar entry {}", effective_name);
                skip_payload(&mut reader, padded_size)?;
                continue;
            }
        };
        let target = dest.join(&rel);

        match header.typeflag {
            header::TYPE_DIRECTORY => {
                reconcile_conflict(&target, true).map_err(io_err)?;
                fs::create_dir_all(&target).map_err(io_err)?;
                apply_ownership(&target, &header, opts);
                dir_mtimes.push(PendingDirMtime { path: target, mtime: header.mtime });
            }
            header::TYPE_SYMLINK => {
                reconcile_conflict(&target, false).map_err(io_err)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                symlink(&effective_link, &target).map_err(io_err)?;
            }
            header::TYPE_HARDLINK => {
                reconcile_conflict(&target, false).map_err(io_err)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                let link_target = dest.join(&effective_link);
                if fs::hard_link(&link_target, &target).is_err() {
                    debug!("hard link target {} not yet present; writing empty file", link_target.display());
                    fs::write(&target, []).map_err(io_err)?;
                }
            }
            header::TYPE_REGULAR | header::TYPE_REGULAR_ALT => {
                reconcile_conflict(&target, false).map_err(io_err)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                let data = read_exact_payload(&mut reader, header.size as usize, padded_size)?;
                fs::write(&target, &data).map_err(io_err)?;

                let mode = if header.mode == 0 { 0o755 } else { header.mode };
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
                apply_ownership(&target, &header, opts);
                set_mtime(&target, header.mtime);
            }
            other => {
                debug!("skipping unsupported tar entry type {:?} at {}", other as char, effective_name);
                skip_payload(&mut reader, padded_size)?;
            }
        }
    }

    for pending in dir_mtimes {
        set_mtime(&pending.path, pending.mtime);
    }

    Ok(())
}

fn reconcile_conflict(target: &Path, incoming_is_dir: bool) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(target) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if meta.is_dir() && !incoming_is_dir {
        fs::remove_dir_all(target)?;
    } else if !meta.is_dir() && incoming_is_dir {
        fs::remove_file(target)?;
    } else if !meta.is_dir() && !incoming_is_dir {
        let _ = fs::remove_file(target);
    }
    Ok(())
}

fn apply_ownership(path: &Path, header: &UstarHeader, opts: &ExtractOptions) {
    if !opts.preserve_ownership {
        return;
    }
    let uid = opts.uid_override.unwrap_or(header.uid);
    let gid = opts.gid_override.unwrap_or(header.gid);
    let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let ret = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        warn!(
            "failed to chown {} to {}:{}: {}",
            path.display(),
            uid,
            gid,
            std::io::Error::last_os_error()
        );
    }
}

fn set_mtime(path: &Path, mtime: i64) {
    let times = [
        libc::timespec { tv_sec: mtime, tv_nsec: 0 },
        libc::timespec { tv_sec: mtime, tv_nsec: 0 },
    ];
    let c_path = match std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let ret = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if ret != 0 {
        warn!("failed to set mtime on {}: {}", path.display(), std::io::Error::last_os_error());
    }
}

enum ReadOutcome {
    Ok,
    Eof,
    Partial,
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8; BLOCK_SIZE]) -> ReadOutcome {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial };
            }
            Ok(n) => filled += n,
            Err(_) => return ReadOutcome::Partial,
        }
    }
    ReadOutcome::Ok
}

fn pad_up(size: usize) -> usize {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        size
    } else {
        size + (BLOCK_SIZE - rem)
    }
}

fn read_exact_payload<R: Read>(reader: &mut R, size: usize, padded_size: usize) -> Result<Vec<u8>, TarError> {
    let mut buf = vec![0u8; padded_size];
    reader
        .read_exact(&mut buf)
        .map_err(|_| TarError::Extraction { name: "<payload>".to_string() })?;
    buf.truncate(size);
    Ok(buf)
}

fn skip_payload<R: Read>(reader: &mut R, padded_size: usize) -> Result<(), TarError> {
    let mut buf = vec![0u8; padded_size];
    reader
        .read_exact(&mut buf)
        .map_err(|_| TarError::Extraction { name: "<payload>".to_string() })?;
    Ok(())
}

fn trim_nul(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

fn io_err(e: std::io::Error) -> TarError {
    TarError::BadHeader { reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar::writer::write_tar;

    #[test]
    fn unsafe_entries_are_skipped_not_written_outside_dest() {
        let mut archive = Vec::new();
        {
            let h = UstarHeader {
                name: "../escape.txt".into(),
                prefix: String::new(),
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 0,
                mtime: 0,
                typeflag: header::TYPE_REGULAR,
                linkname: String::new(),
            };
            archive.extend(h.serialize().unwrap());
            archive.extend([0u8; BLOCK_SIZE * 2]);
        }
        let dest = tempfile::tempdir().unwrap();
        extract_stream(&archive[..], dest.path(), &ExtractOptions::default()).unwrap();
        assert!(!dest.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn directory_replacing_a_file_removes_the_file_first() {
        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("thing"), b"old").unwrap();

        let mut archive = Vec::new();
        let h = UstarHeader {
            name: "thing/".into(),
            prefix: String::new(),
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            typeflag: header::TYPE_DIRECTORY,
            linkname: String::new(),
        };
        archive.extend(h.serialize().unwrap());
        archive.extend([0u8; BLOCK_SIZE * 2]);

        extract_stream(&archive[..], dest.path(), &ExtractOptions::default()).unwrap();
        assert!(dest.path().join("thing").is_dir());
    }

    #[test]
    fn long_names_round_trip_through_pax() {
        let src = tempfile::tempdir().unwrap();
        let deep = "d".repeat(40);
        let nested = format!("{}/{}/{}/file.txt", deep, deep, deep);
        let full_path = src.path().join(&nested);
        fs::create_dir_all(full_path.parent().unwrap()).unwrap();
        fs::write(&full_path, b"payload").unwrap();

        let mut buf = Vec::new();
        write_tar(src.path(), &mut buf).unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_stream(&buf[..], dest.path(), &ExtractOptions::default()).unwrap();
        let extracted = fs::read(dest.path().join(&nested)).unwrap();
        assert_eq!(extracted, b"payload");
    }
}
