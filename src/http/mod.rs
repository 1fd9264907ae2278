//! Minimal HTTP fetcher: GET/POST, manual redirect policy,
//! Basic Auth from URL userinfo or a `.git-credentials`-style file.

pub mod client;
pub mod credentials;

pub use client::{Body, Client, Response};
pub use credentials::{Credential, CredentialsFile};
