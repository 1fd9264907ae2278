//! Structured error types for each subsystem, composed under `BqError`.
//!
//! Orchestration-level call sites use `anyhow::Result` and attach `.context(..)`;
//! subsystem code returns these concrete variants so callers can match on them
//! when they need to (e.g. the resume engine distinguishing a digest mismatch
//! from a missing file).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BqError {
    #[error(transparent)]
    Tar(#[from] TarError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TarError {
    #[error("archive ended mid-payload for entry {name:?}")]
    Extraction { name: String },

    #[error("long path error: {name:?} exceeds 99 bytes even after PAX-fallback truncation")]
    LongPath { name: String },

    #[error("malformed ustar header: {reason}")]
    BadHeader { reason: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned non-2xx status {status}")]
    Status { url: String, status: u16 },

    #[error("redirect chain from {url} exceeded {max_hops} hops")]
    TooManyRedirects { url: String, max_hops: u32 },

    #[error("redirect response from {url} carried no Location header")]
    MissingLocation { url: String },

    #[error("could not read request body for {url}: {source}")]
    BodyIo {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    Sha256Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("crc32 mismatch for {path}: expected {expected:08x}, got {actual:08x}")]
    Crc32Mismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("{syscall} failed: {errno} ({description})")]
    Syscall {
        syscall: &'static str,
        errno: i32,
        description: String,
    },

    #[error("{syscall} failed with EPERM: unprivileged user namespaces appear disabled.\n\
             Enable them with: sudo sysctl -w kernel.unprivileged_userns_clone=1")]
    UnprivilegedUserNsDisabled { syscall: &'static str },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command failed (exit {exit_code:?}): {argv:?}")]
    Failed {
        argv: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("patch {path} did not apply: {argv:?} exited {exit_code}")]
    PatchFailed {
        path: PathBuf,
        argv: Vec<String>,
        exit_code: i32,
    },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("unknown package(s): {0:?}")]
    UnknownPackages(Vec<String>),

    #[error("plan format_version {found} is not supported (only version 2 is); migrate the plan")]
    UnsupportedFormatVersion { found: i64 },

    #[error("overrides attempted a forbidden transformation: {0}")]
    ForbiddenOverride(String),

    #[error("build plan is empty")]
    EmptyPlan,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("malformed pkt-line length header: {0:?}")]
    BadPktLineLength(String),

    #[error("remote returned error: {0}")]
    RemoteError(String),

    #[error("could not resolve ref {0}: `git rev-parse --verify` did not return a 40-hex oid")]
    UnresolvedRef(String),
}
