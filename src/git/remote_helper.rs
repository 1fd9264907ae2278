//! Git smart-HTTP remote-helper protocol on stdin/stdout.
//!
//! Commands: `capabilities`, `option …`, `list`, `fetch …` (batched to one
//! upload-pack request), `push …` (batched to one receive-pack request),
//! `quit`. Local ref resolution and pack generation shell out to the host
//! `git`.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::GitError;
use crate::http::{Body, Client};
use crate::process::Cmd;
use super::pktline::{self, PktLine};

pub struct RemoteHelper {
    base_url: String,
    client: Client,
    refs: Option<Vec<(String, String)>>,
}

impl RemoteHelper {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
            refs: None,
        }
    }

    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> Result<()> {
        loop {
            let mut line = String::new();
            let n = input.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let line = line.trim_end_matches('\n').to_string();

            if line == "capabilities" {
                writeln!(output, "fetch")?;
                writeln!(output, "push")?;
                writeln!(output, "option")?;
                writeln!(output)?;
            } else if line.starts_with("option ") {
                writeln!(output, "ok")?;
            } else if line.starts_with("list") {
                self.ensure_refs_loaded()?;
                for (oid, name) in self.refs.clone().unwrap_or_default() {
                    writeln!(output, "{} {}", oid, name)?;
                }
                writeln!(output)?;
            } else if line.starts_with("fetch ") {
                let mut wants = vec![parse_fetch_line(&line)?];
                loop {
                    let mut next = String::new();
                    if input.read_line(&mut next)? == 0 {
                        break;
                    }
                    let next = next.trim_end_matches('\n').to_string();
                    if next.is_empty() {
                        break;
                    }
                    wants.push(parse_fetch_line(&next)?);
                }
                self.do_fetch(&wants, &mut output)?;
                writeln!(output)?;
            } else if line.starts_with("push ") {
                let mut refspecs = vec![parse_push_line(&line)?];
                loop {
                    let mut next = String::new();
                    if input.read_line(&mut next)? == 0 {
                        break;
                    }
                    let next = next.trim_end_matches('\n').to_string();
                    if next.is_empty() {
                        break;
                    }
                    refspecs.push(parse_push_line(&next)?);
                }
                self.do_push(&refspecs, &mut output)?;
                writeln!(output)?;
            } else if line == "quit" {
                break;
            } else if line.is_empty() {
                continue;
            } else {
                debug!("remote helper: ignoring unrecognized command {:?}", line);
            }
            output.flush()?;
        }
        Ok(())
    }

    fn ensure_refs_loaded(&mut self) -> Result<()> {
        if self.refs.is_some() {
            return Ok(());
        }
        let url = format!("{}/info/refs?service=git-upload-pack", self.base_url);
        let resp = self.client.get(&url).with_context(|| format!("fetching {}", url))?;
        self.refs = Some(parse_info_refs(&resp.body)?);
        Ok(())
    }

    fn do_fetch<W: Write>(&self, wants: &[String], output: &mut W) -> Result<()> {
        let mut body = Vec::new();
        for (i, oid) in wants.iter().enumerate() {
            let line = if i == 0 {
                format!("want {} multi_ack_detailed side-band-64k\n", oid)
            } else {
                format!("want {}\n", oid)
            };
            body.extend(pktline::encode(line.as_bytes()));
        }
        body.extend(pktline::encode(b"done\n"));
        body.extend(pktline::encode_flush());

        let url = format!("{}/git-upload-pack", self.base_url);
        let resp = self
            .client
            .post_with_headers(&url, Body::Bytes(body), &[("Content-Type", "application/x-git-upload-pack-request")])
            .with_context(|| format!("posting upload-pack request to {}", url))?;

        let mut rest = &resp.body[..];
        loop {
            let (line, consumed) = pktline::decode_one(rest).map_err(GitError::from)?;
            rest = &rest[consumed..];
            match line {
                PktLine::Flush => break,
                PktLine::Data(d) => {
                    let text = String::from_utf8_lossy(&d);
                    if let Some(msg) = text.strip_prefix("ERR ") {
                        anyhow::bail!(GitError::RemoteError(msg.trim().to_string()));
                    }
                    // ACK/NAK lines are drained silently until the flush.
                }
            }
        }
        output.write_all(rest)?;
        Ok(())
    }

    fn do_push<W: Write>(&self, refspecs: &[(String, String)], output: &mut W) -> Result<()> {
        let mut commands = Vec::new();
        for (i, (src, dst)) in refspecs.iter().enumerate() {
            let old_oid = resolve_remote_oid(dst, &self.refs).unwrap_or_else(|| "0".repeat(40));
            let new_oid = if src.is_empty() {
                "0".repeat(40)
            } else {
                resolve_local_oid(src)?
            };
            let caps = if i == 0 { " report-status" } else { "" };
            commands.push(format!("{} {} {}{}", old_oid, new_oid, dst, caps));
        }

        let mut body = Vec::new();
        for cmd in &commands {
            body.extend(pktline::encode(format!("{}\0", cmd).as_bytes()));
        }
        body.extend(pktline::encode_flush());

        let any_new = refspecs.iter().any(|(src, _)| !src.is_empty());
        if any_new {
            let pack = Cmd::new("git")
                .args(["pack-objects", "--stdout", "--all"])
                .error_msg("git pack-objects failed")
                .run()?;
            body.extend(pack.stdout.into_bytes());
        }

        let url = format!("{}/git-receive-pack", self.base_url);
        let resp = self
            .client
            .post_with_headers(&url, Body::Bytes(body), &[("Content-Type", "application/x-git-receive-pack-request")])
            .with_context(|| format!("posting receive-pack request to {}", url))?;

        for line in String::from_utf8_lossy(&resp.body).lines() {
            if line == "unpack ok" || line.starts_with("ok ") || line.starts_with("ng ") {
                writeln!(output, "{}", line)?;
            }
        }
        Ok(())
    }
}

fn parse_fetch_line(line: &str) -> Result<String> {
    let mut parts = line.split_whitespace();
    parts.next(); // "fetch"
    let oid = parts.next().context("fetch command missing oid")?;
    Ok(oid.to_string())
}

fn parse_push_line(line: &str) -> Result<(String, String)> {
    let spec = line.strip_prefix("push ").context("malformed push command")?;
    let (src, dst) = spec.split_once(':').context("push refspec missing ':'")?;
    Ok((src.to_string(), dst.to_string()))
}

fn parse_info_refs(body: &[u8]) -> Result<Vec<(String, String)>> {
    let lines = pktline::decode_all(body).map_err(GitError::from)?;
    let mut refs = Vec::new();
    let mut first = true;
    for line in lines {
        let data = match line {
            PktLine::Flush => continue,
            PktLine::Data(d) => d,
        };
        let text = String::from_utf8_lossy(&data);
        let text = text.trim_end_matches('\n');
        if text.starts_with("# service=") {
            continue;
        }
        let (ref_part, _caps) = if first {
            match text.split_once('\0') {
                Some((r, c)) => (r, Some(c)),
                None => (text, None),
            }
        } else {
            (text, None)
        };
        first = false;
        if let Some((oid, name)) = ref_part.split_once(' ') {
            refs.push((oid.to_string(), name.to_string()));
        }
    }
    Ok(refs)
}

fn resolve_remote_oid(refname: &str, cached: &Option<Vec<(String, String)>>) -> Option<String> {
    cached
        .as_ref()?
        .iter()
        .find(|(_, n)| n == refname)
        .map(|(oid, _)| oid.clone())
}

fn resolve_local_oid(refname: &str) -> Result<String> {
    let result = Cmd::new("git")
        .args(["rev-parse", "--verify", refname])
        .error_msg("git rev-parse failed")
        .run()?;
    let oid = result.stdout_trimmed().to_string();
    if oid.len() == 40 && oid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(oid)
    } else {
        anyhow::bail!(GitError::UnresolvedRef(refname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_info_refs_with_capability_list_on_first_line() {
        let mut body = Vec::new();
        body.extend(pktline::encode(b"# service=git-upload-pack\n"));
        body.extend(pktline::encode_flush());
        body.extend(pktline::encode(
            format!("{} refs/heads/main\0multi_ack thin-pack\n", "a".repeat(40)).as_bytes(),
        ));
        body.extend(pktline::encode(format!("{} refs/heads/dev\n", "b".repeat(40)).as_bytes()));
        body.extend(pktline::encode_flush());

        let refs = parse_info_refs(&body).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].1, "refs/heads/main");
        assert_eq!(refs[1].1, "refs/heads/dev");
    }

    #[test]
    fn parse_push_line_splits_src_and_dst() {
        let (src, dst) = parse_push_line("push refs/heads/main:refs/heads/main").unwrap();
        assert_eq!(src, "refs/heads/main");
        assert_eq!(dst, "refs/heads/main");
    }
}
