//! Minimal HTTP client: GET/POST with byte or file bodies, optional extra
//! request headers, manual redirect following per a fixed method/body
//! transform table, and Basic Auth derived from URL userinfo or a
//! credentials file.

use std::path::{Path, PathBuf};

use reqwest::blocking::Client as ReqwestClient;
use reqwest::{Method, StatusCode, Url};

use crate::error::FetchError;
use super::credentials::CredentialsFile;

const USER_AGENT: &str = "bq2/0.1";
const MAX_REDIRECTS: u32 = 10;

#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Body {
    fn rewind(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Body::Bytes(b) => Ok(b.clone()),
            Body::File(path) => std::fs::read(path),
        }
    }
}

pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub final_url: Url,
}

pub struct Client {
    inner: ReqwestClient,
    credentials: Option<CredentialsFile>,
}

impl Client {
    pub fn new() -> Self {
        let inner = ReqwestClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .expect("building reqwest client");
        Self { inner, credentials: None }
    }

    pub fn with_credentials(mut self, file: CredentialsFile) -> Self {
        self.credentials = Some(file);
        self
    }

    pub fn get(&self, url: &str) -> Result<Response, FetchError> {
        self.request(Method::GET, url, None, &[])
    }

    pub fn post(&self, url: &str, body: Body) -> Result<Response, FetchError> {
        self.request(Method::POST, url, Some(body), &[])
    }

    /// Like [`Client::post`], with extra request headers (e.g. the
    /// `Content-Type` git's smart-HTTP protocol requires per service).
    pub fn post_with_headers(&self, url: &str, body: Body, headers: &[(&str, &str)]) -> Result<Response, FetchError> {
        self.request(Method::POST, url, Some(body), headers)
    }

    pub fn request(&self, method: Method, url: &str, body: Option<Body>, headers: &[(&str, &str)]) -> Result<Response, FetchError> {
        let mut current_url = Url::parse(url).map_err(|_| FetchError::MissingLocation { url: url.to_string() })?;
        let mut current_method = method;
        let mut current_body = body;
        let mut hops = 0;

        loop {
            let (send_url, auth) = self.resolve_auth(&current_url);
            let mut builder = self.inner.request(current_method.clone(), send_url.clone());
            if let Some((user, pass)) = auth {
                builder = builder.basic_auth(user, Some(pass));
            }
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            if let Some(ref b) = current_body {
                let bytes = b.rewind().map_err(|e| FetchError::BodyIo {
                    url: send_url.to_string(),
                    source: e,
                })?;
                builder = builder.body(bytes);
            }

            let resp = builder.send().map_err(|e| FetchError::Transport {
                url: send_url.to_string(),
                source: e,
            })?;

            let status = resp.status();
            if is_redirect(status) {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects {
                        url: send_url.to_string(),
                        max_hops: MAX_REDIRECTS,
                    });
                }
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::MissingLocation { url: send_url.to_string() })?;
                let next_url = current_url
                    .join(location)
                    .map_err(|_| FetchError::MissingLocation { url: send_url.to_string() })?;

                let (next_method, next_body) = transform_for_redirect(status, &current_method, current_body.take());
                current_url = next_url;
                current_method = next_method;
                current_body = next_body;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Status {
                    url: send_url.to_string(),
                    status: status.as_u16(),
                });
            }

            let final_url = resp.url().clone();
            let body = resp.bytes().map_err(|e| FetchError::Transport {
                url: send_url.to_string(),
                source: e,
            })?;
            return Ok(Response {
                status: status.as_u16(),
                body: body.to_vec(),
                final_url,
            });
        }
    }

    pub fn download_to_file(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let resp = self.get(url)?;
        std::fs::write(dest, &resp.body).map_err(|e| FetchError::BodyIo {
            url: url.to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Returns the URL to send (userinfo stripped) and, if any, the
    /// basic-auth pair to inject — either from the URL's own userinfo or
    /// from the longest-matching credentials-file entry.
    fn resolve_auth(&self, url: &Url) -> (Url, Option<(String, String)>) {
        let mut stripped = url.clone();
        if !url.username().is_empty() {
            let user = url.username().to_string();
            let pass = url.password().unwrap_or("").to_string();
            let _ = stripped.set_username("");
            let _ = stripped.set_password(None);
            return (stripped, Some((user, pass)));
        }
        if let Some(creds) = &self.credentials {
            if let Some(c) = creds.best_match(url) {
                return (stripped, Some((c.user.clone(), c.pass.clone())));
            }
        }
        (stripped, None)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// The method/body transform table for redirect responses.
fn transform_for_redirect(status: StatusCode, method: &Method, body: Option<Body>) -> (Method, Option<Body>) {
    match status.as_u16() {
        307 | 308 => (method.clone(), body),
        303 => (Method::GET, None),
        301 | 302 => {
            if *method == Method::POST {
                (Method::GET, None)
            } else {
                (method.clone(), body)
            }
        }
        _ => (method.clone(), body),
    }
}
