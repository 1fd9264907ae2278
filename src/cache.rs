//! Content-addressed source cache, fed by the [`crate::http`] fetcher.
//! Hash sidecar read/write, trust existing output if the sidecar is
//! missing, else compare, with a sha256/crc32 digest and retry/backoff
//! on download.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::digest::{hex_crc32, hex_sha256};
use crate::error::VerificationError;
use crate::http::Client;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

pub struct CacheEntry {
    pub path: PathBuf,
    pub sha256: String,
    pub crc32: u32,
}

/// Ensures `<cache_dir>/<name>-<basename>` exists and is verified, fetching
/// it if necessary. `expected_sha256` is the hard-coded catalog value, if
/// any; `checksum_sidecar_url`, if given, is fetched and its first
/// whitespace-delimited token used as a fallback expected digest.
pub fn ensure_cached(
    client: &Client,
    cache_dir: &Path,
    name: &str,
    url: &str,
    expected_sha256: Option<&str>,
    checksum_sidecar_url: Option<&str>,
) -> Result<CacheEntry> {
    std::fs::create_dir_all(cache_dir)?;

    let basename = url.rsplit('/').next().unwrap_or(url);
    let dest = cache_dir.join(format!("{}-{}", name, basename));
    let sha256_sidecar = sidecar_path(&dest, "sha256");
    let crc32_sidecar = sidecar_path(&dest, "crc32");

    let expected = resolve_expected_sha256(client, &sha256_sidecar, expected_sha256, checksum_sidecar_url)?;

    for attempt in 1..=MAX_ATTEMPTS {
        if !file_present_and_nonempty(&dest) {
            info!("downloading {} -> {}", url, dest.display());
            client
                .download_to_file(url, &dest)
                .with_context(|| format!("downloading {}", url))?;
        } else {
            debug!("{} already present in cache", dest.display());
        }

        let bytes = std::fs::read(&dest).with_context(|| format!("reading {}", dest.display()))?;
        let actual_sha256 = hex_sha256(&bytes);
        let actual_crc32 = hex_crc32(&bytes);

        if let Some(expected_sha) = &expected {
            if &actual_sha256 != expected_sha {
                warn!(
                    "sha256 mismatch for {} (attempt {}/{}): expected {}, got {}",
                    dest.display(),
                    attempt,
                    MAX_ATTEMPTS,
                    expected_sha,
                    actual_sha256
                );
                let _ = std::fs::remove_file(&dest);
                if attempt == MAX_ATTEMPTS {
                    return Err(VerificationError::Sha256Mismatch {
                        path: dest,
                        expected: expected_sha.clone(),
                        actual: actual_sha256,
                    }
                    .into());
                }
                sleep(RETRY_BACKOFF);
                continue;
            }
        }

        if let Some(expected_crc) = cached_crc32(&crc32_sidecar) {
            if expected_crc != actual_crc32 {
                warn!(
                    "crc32 mismatch for {} (attempt {}/{}): expected {:08x}, got {:08x}",
                    dest.display(),
                    attempt,
                    MAX_ATTEMPTS,
                    expected_crc,
                    actual_crc32
                );
                let _ = std::fs::remove_file(&dest);
                if attempt == MAX_ATTEMPTS {
                    return Err(VerificationError::Crc32Mismatch {
                        path: dest,
                        expected: expected_crc,
                        actual: actual_crc32,
                    }
                    .into());
                }
                sleep(RETRY_BACKOFF);
                continue;
            }
        }

        std::fs::write(&sha256_sidecar, &actual_sha256)?;
        std::fs::write(&crc32_sidecar, format!("{:08x}", actual_crc32))?;

        return Ok(CacheEntry {
            path: dest,
            sha256: actual_sha256,
            crc32: actual_crc32,
        });
    }

    bail!("unreachable: retry loop exited without resolving {}", dest.display());
}

fn resolve_expected_sha256(
    client: &Client,
    sha256_sidecar: &Path,
    hardcoded: Option<&str>,
    checksum_sidecar_url: Option<&str>,
) -> Result<Option<String>> {
    if let Some(v) = hardcoded {
        return Ok(Some(v.to_string()));
    }
    if sha256_sidecar.exists() {
        return Ok(Some(std::fs::read_to_string(sha256_sidecar)?.trim().to_string()));
    }
    if let Some(sidecar_url) = checksum_sidecar_url {
        let resp = client
            .get(sidecar_url)
            .with_context(|| format!("fetching checksum sidecar {}", sidecar_url))?;
        let text = String::from_utf8_lossy(&resp.body);
        let token = text.split_whitespace().next().map(str::to_string);
        return Ok(token);
    }
    Ok(None)
}

fn cached_crc32(path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    u32::from_str_radix(text.trim(), 16).ok()
}

fn sidecar_path(dest: &Path, ext: &str) -> PathBuf {
    let mut s = dest.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn file_present_and_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_appends_extension() {
        let p = sidecar_path(Path::new("/x/m4-1.4.19.tar.gz"), "sha256");
        assert_eq!(p, PathBuf::from("/x/m4-1.4.19.tar.gz.sha256"));
    }

    #[test]
    fn cached_crc32_parses_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.crc32");
        std::fs::write(&path, "deadbeef").unwrap();
        assert_eq!(cached_crc32(&path), Some(0xdeadbeef));
    }

    #[test]
    fn second_run_with_intact_file_does_no_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg-archive.tar.gz");
        std::fs::write(&dest, b"hello world").unwrap();
        let sha = hex_sha256(b"hello world");
        std::fs::write(sidecar_path(&dest, "sha256"), &sha).unwrap();
        std::fs::write(sidecar_path(&dest, "crc32"), format!("{:08x}", hex_crc32(b"hello world"))).unwrap();

        let client = Client::new();
        let entry = ensure_cached(&client, dir.path(), "pkg", "https://example.invalid/archive.tar.gz", None, None).unwrap();
        assert_eq!(entry.sha256, sha);
    }
}
