use std::{env, path::Path};

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::info;
use unicode_normalization::UnicodeNormalization;

async fn download_file(url: &str, path: &Path) -> Result<()> {
    info!("Downloading {} from {}", path.display(), url);

    let mut header_map = HeaderMap::new();

    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Invalid GITHUB_TOKEN format")?;
        header_map.insert(reqwest::header::AUTHORIZATION, auth_value);
    }
    header_map.insert(
        HeaderName::from_static("accept"),
        HeaderValue::from_static("application/octet-stream"),
    );

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .with_context(|| format!("Failed to send request to {url}"))?;

    if !response.status().is_success() {
        bail!("Failed to download {}: {}", url, response.status());
    }

    let bytes = response.bytes().await.context("Failed to read bytes")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Fetches `path` from `url` when the file is missing locally.
///
/// Returns `Ok(false)` when the file is absent and no URL is configured.
pub async fn ensure_file_exists(path: &Path, url: Option<&str>) -> Result<bool> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(true);
    }
    match url {
        Some(url) => {
            download_file(url, path).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Reduces a client supplied file name to a safe, flat storage key.
///
/// NFKD-normalized then reduced to ASCII, so accented letters keep their
/// base letter; path separators become spaces, whitespace runs become `_`,
/// anything outside `[A-Za-z0-9_.-]` is dropped and leading/trailing `.`/`_`
/// are trimmed. May return an empty string.
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name.nfkd().filter(char::is_ascii).collect();
    let flattened = ascii.replace(&['/', '\\'][..], " ");
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(*ch, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|ch: char| ch == '.' || ch == '_').to_string()
}

/// Final path component of an artifact path; directories are discarded.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn secure_filename_strips_paths_and_unsafe_characters() {
        assert_eq!(secure_filename("cat.png"), "cat.png");
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("C:\\photos\\dög.jpg"), "C_photos_dog.jpg");
        assert_eq!(
            secure_filename("i contain cool \u{fc}ml\u{e4}uts.txt"),
            "i_contain_cool_umlauts.txt"
        );
        assert_eq!(secure_filename("a;b&c$.png"), "abc.png");
        assert_eq!(secure_filename("\u{fc}mlauts.png"), "umlauts.png");
        assert_eq!(secure_filename("caf\u{e9}.jpg"), "cafe.jpg");
        assert_eq!(secure_filename("\u{ff21}\u{ff22}.png"), "AB.png");
    }

    #[test]
    fn secure_filename_can_collapse_to_nothing() {
        assert_eq!(secure_filename(".."), "");
        assert_eq!(secure_filename("///"), "");
        assert_eq!(secure_filename("\u{732b}"), "");
    }

    #[test]
    fn file_name_of_drops_directories() {
        assert_eq!(file_name_of(&PathBuf::from("/tmp/out_cat.png")), "out_cat.png");
        assert_eq!(file_name_of(&PathBuf::from("results/fill.png")), "fill.png");
        assert_eq!(file_name_of(&PathBuf::from("plain.png")), "plain.png");
    }

    #[tokio::test]
    async fn ensure_file_exists_without_url_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("sample.zip");
        assert!(!ensure_file_exists(&missing, None).await.unwrap());

        std::fs::write(&missing, b"zip").unwrap();
        assert!(ensure_file_exists(&missing, None).await.unwrap());
    }
}
