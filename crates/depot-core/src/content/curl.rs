//! libcurl downloader for http, https, and file URLs.
//!
//! Each item is written to `<destination>.part` and renamed into place once the
//! transfer completes, so a failed download never leaves a truncated file at
//! the destination.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::downloader::{DownloadItem, Downloader};
use super::source::ContentSource;
use crate::config::ContentConfig;

/// Single-stream GET downloader.
#[derive(Debug, Clone)]
pub struct CurlDownloader {
    connect_timeout: Duration,
    timeout: Duration,
    max_recv_speed: Option<u64>,
    headers: BTreeMap<String, String>,
}

impl CurlDownloader {
    pub fn new(config: &ContentConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            max_recv_speed: None,
            headers: BTreeMap::new(),
        }
    }

    /// Downloader honoring a source's `max_speed` (bytes/s) and `headers`
    /// descriptor properties.
    pub fn for_source(source: &ContentSource, config: &ContentConfig) -> Self {
        let mut downloader = Self::new(config);
        if let Some(speed) = source.properties.get("max_speed").and_then(|v| v.as_integer()) {
            if speed > 0 {
                downloader.max_recv_speed = Some(speed as u64);
            }
        }
        if let Some(headers) = source.properties.get("headers").and_then(|v| v.as_table()) {
            for (name, value) in headers {
                match value.as_str() {
                    Some(value) => {
                        downloader.headers.insert(name.clone(), value.to_string());
                    }
                    None => tracing::warn!(source_id = %source.id, header = %name, "ignoring non-string header"),
                }
            }
        }
        downloader
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn easy(&self, url: &str) -> Result<curl::easy::Easy> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url).context("invalid URL")?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        if let Some(speed) = self.max_recv_speed {
            easy.max_recv_speed(speed).map_err(|e| anyhow::anyhow!("curl: {}", e))?;
        }
        easy.connect_timeout(self.connect_timeout)?;
        easy.low_speed_limit(1024).map_err(|e| anyhow::anyhow!("curl: {}", e))?;
        easy.low_speed_time(Duration::from_secs(60))?;
        easy.timeout(self.timeout)?;
        if !self.headers.is_empty() {
            let mut list = curl::easy::List::new();
            for (k, v) in &self.headers {
                list.append(&format!("{}: {}", k.trim(), v.trim()))?;
            }
            easy.http_headers(list)?;
        }
        Ok(easy)
    }

    /// GETs `url` into memory.
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let is_http = check_scheme(url)?;
        let mut easy = self.easy(url)?;
        let mut body = Vec::new();
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| {
                body.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer
                .perform()
                .with_context(|| format!("GET {} failed", url))?;
        }
        check_response(&mut easy, url, is_http)?;
        Ok(body)
    }

    fn fetch_to(&self, url: &str, part: &Path) -> Result<u64> {
        let is_http = check_scheme(url)?;
        let mut easy = self.easy(url)?;
        let mut file =
            File::create(part).with_context(|| format!("create {}", part.display()))?;
        let mut written = 0u64;
        let mut write_error = None;
        let performed = {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| match file.write_all(data) {
                Ok(()) => {
                    written += data.len() as u64;
                    Ok(data.len())
                }
                Err(e) => {
                    write_error = Some(e);
                    Ok(0) // abort transfer
                }
            })?;
            transfer.perform()
        };
        if let Some(e) = write_error {
            return Err(e).with_context(|| format!("write {}", part.display()));
        }
        performed.with_context(|| format!("GET {} failed", url))?;
        check_response(&mut easy, url, is_http)?;
        file.flush().with_context(|| format!("flush {}", part.display()))?;
        Ok(written)
    }
}

impl Downloader for CurlDownloader {
    fn download_one(&self, item: &DownloadItem) -> Result<()> {
        if let Some(parent) = item.destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        let part = part_path(&item.destination);
        match self.fetch_to(&item.url, &part) {
            Ok(bytes) => {
                std::fs::rename(&part, &item.destination).with_context(|| {
                    format!("rename {} -> {}", part.display(), item.destination.display())
                })?;
                tracing::debug!(url = %item.url, bytes, dest = %item.destination.display(), "downloaded");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&part) {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!(part = %part.display(), "could not remove partial download: {}", rm);
                    }
                }
                Err(e)
            }
        }
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Returns whether the URL is http(s); rejects schemes other than file.
fn check_scheme(url: &str) -> Result<bool> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {}", url))?;
    match parsed.scheme() {
        "http" | "https" => Ok(true),
        "file" => Ok(false),
        other => anyhow::bail!("unsupported URL scheme {:?}: {}", other, url),
    }
}

fn check_response(easy: &mut curl::easy::Easy, url: &str, is_http: bool) -> Result<()> {
    if !is_http {
        return Ok(());
    }
    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        anyhow::bail!("GET {} returned HTTP {}", url, code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::test_support::NullCataloger;
    use std::sync::Arc;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/pkg/zsh-5.0.rpm")),
            PathBuf::from("/tmp/pkg/zsh-5.0.rpm.part")
        );
    }

    #[test]
    fn schemes() {
        assert!(check_scheme("https://h/x").unwrap());
        assert!(!check_scheme("file:///tmp/x").unwrap());
        assert!(check_scheme("ftp://h/x").is_err());
        assert!(check_scheme("not a url").is_err());
    }

    #[test]
    fn source_properties_configure_downloader() {
        let mut source = ContentSource::new("s", "yum", "http://h/", Arc::new(NullCataloger));
        let props: toml::Table = toml::from_str(
            "max_speed = 2048\nheaders = { Authorization = \"token\", Bad = 3 }",
        )
        .unwrap();
        source.properties = props.into_iter().collect();
        let downloader = CurlDownloader::for_source(&source, &ContentConfig::default());
        assert_eq!(downloader.max_recv_speed, Some(2048));
        assert_eq!(downloader.headers.len(), 1);
        assert_eq!(downloader.headers["Authorization"], "token");
    }

    #[test]
    fn copies_file_urls_and_leaves_no_part_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.txt");
        std::fs::write(&origin, b"hello depot").unwrap();
        let origin_url = url::Url::from_file_path(&origin).unwrap().to_string();
        let downloader = CurlDownloader::new(&ContentConfig::default());

        let dest = dir.path().join("out").join("copy.txt");
        let item = DownloadItem {
            url: origin_url,
            destination: dest.clone(),
            tag: 0,
        };
        downloader.download_one(&item).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello depot");

        let missing = DownloadItem {
            url: url::Url::from_file_path(dir.path().join("missing.txt"))
                .unwrap()
                .to_string(),
            destination: dir.path().join("out").join("missing.txt"),
            tag: 1,
        };
        assert!(downloader.download_one(&missing).is_err());
        assert!(!missing.destination.exists());
        assert!(!part_path(&missing.destination).exists());
    }
}
