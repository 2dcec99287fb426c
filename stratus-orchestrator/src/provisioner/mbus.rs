use anyhow::{Context, Result};
use reqwest::Url;
use std::net::IpAddr;
use std::path::Path;
use stratus_common::CpiError;
use tokio::io::AsyncWriteExt;

/// Replaces the host of `url`, keeping scheme, credentials, port and path.
pub fn rewrite_host(url: &str, ip: &IpAddr) -> Result<String, CpiError> {
    let mut parsed = Url::parse(url)
        .map_err(|e| CpiError::Configuration(format!("invalid url '{}': {}", url, e)))?;
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    parsed
        .set_host(Some(&host))
        .map_err(|e| CpiError::Configuration(format!("cannot set host of '{}': {}", url, e)))?;

    let mut out = parsed.to_string();
    // The parser gives path-less http(s) urls a "/" path; keep the caller's form.
    let had_path = url.split_once("://").map_or(true, |(_, rest)| {
        rest.split(|c: char| c == '?' || c == '#')
            .next()
            .map_or(false, |authority_and_path| authority_and_path.contains('/'))
    });
    if !had_path && parsed.path() == "/" {
        let end = out.find(|c: char| c == '?' || c == '#').unwrap_or(out.len());
        if out[..end].ends_with('/') {
            out.remove(end - 1);
        }
    }
    Ok(out)
}

/// `<ip> <fqdn>` line for a hosts file.
pub fn hosts_entry(ip: &str, fqdn: &str) -> String {
    format!("{} {}", ip, fqdn)
}

/// Appends `<ip> <fqdn>` to the hosts file unless an identical line exists.
pub async fn record_host(hosts_file: &Path, ip: &str, fqdn: &str) -> Result<()> {
    let entry = hosts_entry(ip, fqdn);
    let existing = match tokio::fs::read_to_string(hosts_file).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", hosts_file.display()));
        }
    };
    if existing
        .lines()
        .any(|l| l.split_whitespace().collect::<Vec<_>>().join(" ") == entry)
    {
        return Ok(());
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(hosts_file)
        .await
        .with_context(|| format!("opening {}", hosts_file.display()))?;
    let mut line = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        line.push('\n');
    }
    line.push_str(&entry);
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .with_context(|| format!("writing {}", hosts_file.display()))?;
    tracing::info!(hosts_file = %hosts_file.display(), %entry, "hosts entry recorded");
    Ok(())
}
