//! Concurrent HTTP downloads for the `Download` builtin.
//!
//! Fetches every URL of the payload into the destination directory with a
//! bounded number of parallel transfers. Successes and failures are
//! collected per URL so one broken link does not hide the others.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Result, TaskError};

/// `Download` parameter payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadOpts {
    /// Parallel transfers; 0 means one worker per file
    pub workersnum: usize,
    /// Source URLs
    pub fileurls: Vec<String>,
    /// Existing destination directory
    pub destpath: String,
}

/// Download every URL, returning a human-readable summary of what landed
/// where. Fails with the joined per-URL errors when any transfer failed.
pub async fn download_urls(opts: &DownloadOpts) -> Result<String> {
    if opts.fileurls.is_empty() {
        return Err(TaskError::Invalid("files to download are not specified".into()));
    }
    let dest = Path::new(&opts.destpath);
    // mirrors a plain stat: a missing destination is an I/O error
    std::fs::metadata(dest)?;

    let workers = if opts.workersnum == 0 {
        opts.fileurls.len()
    } else {
        opts.workersnum
    };
    let client = Client::new();
    let results: Vec<(String, Result<PathBuf>)> = stream::iter(opts.fileurls.clone())
        .map(|url| {
            let client = client.clone();
            let dest = dest.to_path_buf();
            async move {
                let outcome = fetch_one(&client, &url, &dest).await;
                (url, outcome)
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut summary = String::new();
    let mut failures = Vec::new();
    for (url, outcome) in results {
        match outcome {
            Ok(path) => {
                debug!(url = %url, path = %path.display(), "Download finished");
                summary.push_str(&format!("Downloaded {url} to {}\n", path.display()));
            }
            Err(e) => failures.push(format!("{url}: {e}")),
        }
    }
    if !failures.is_empty() {
        return Err(TaskError::Download(failures.join("; ")));
    }
    Ok(summary)
}

async fn fetch_one(client: &Client, url: &str, dest_dir: &Path) -> Result<PathBuf> {
    let mut response = client.get(url).send().await?.error_for_status()?;
    let path = dest_dir.join(file_name_for(url));
    let mut file = tokio::fs::File::create(&path).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(path)
}

/// Last path segment of the URL, query string stripped. A URL without a
/// path falls back to a fixed name.
fn file_name_for(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let without_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    match without_scheme.trim_end_matches('/').split_once('/') {
        Some((_, path)) => {
            let name = path.rsplit('/').next().unwrap_or("");
            if name.is_empty() {
                "download".to_owned()
            } else {
                name.to_owned()
            }
        }
        None => "download".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_extraction() {
        assert_eq!(file_name_for("https://example.org/files/report.csv"), "report.csv");
        assert_eq!(
            file_name_for("https://example.org/files/report.csv?token=abc"),
            "report.csv"
        );
        assert_eq!(file_name_for("https://example.org/"), "download");
        assert_eq!(file_name_for("https://example.org"), "download");
    }

    #[tokio::test]
    async fn test_rejects_empty_url_list() {
        let opts = DownloadOpts {
            workersnum: 2,
            fileurls: vec![],
            destpath: "/tmp".into(),
        };
        let err = download_urls(&opts).await.unwrap_err();
        assert!(err.to_string().contains("not specified"));
    }

    #[tokio::test]
    async fn test_rejects_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let opts = DownloadOpts {
            workersnum: 1,
            fileurls: vec!["https://example.org/a.txt".into()],
            destpath: gone.to_string_lossy().into_owned(),
        };
        assert!(matches!(download_urls(&opts).await.unwrap_err(), TaskError::Io(_)));
    }

    #[test]
    fn test_payload_parses_wire_names() {
        let opts: DownloadOpts = serde_json::from_str(
            r#"{"workersnum": 3, "fileurls": ["https://example.org/a"], "destpath": "/srv/in"}"#,
        )
        .unwrap();
        assert_eq!(opts.workersnum, 3);
        assert_eq!(opts.destpath, "/srv/in");
    }
}
