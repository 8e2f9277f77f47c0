//! Staging browser cookies for yt-dlp's `--cookies` flag.
//!
//! Cookies are a best-effort enhancement: text that does not look like a
//! Netscape cookie file is ignored with a warning rather than rejected.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    error::DownloadError,
    scratch::{ScratchDir, discard_path},
};

pub const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";

pub fn looks_like_cookie_file(text: &str) -> bool {
    text.starts_with(NETSCAPE_HEADER) || text.contains('\t')
}

#[derive(Debug, Clone)]
pub struct CookieStaging {
    scratch: ScratchDir,
}

impl CookieStaging {
    pub fn new(scratch: ScratchDir) -> Self {
        Self { scratch }
    }

    pub async fn stage(&self, blob: Option<&str>) -> Result<Option<StagedCookies>, DownloadError> {
        let Some(text) = blob.map(str::trim).filter(|text| !text.is_empty()) else {
            return Ok(None);
        };

        if !looks_like_cookie_file(text) {
            warn!("cookie text is not in Netscape format, continuing without cookies");
            return Ok(None);
        }

        self.scratch.ensure().await?;
        let path = self.scratch.unique_cookie_path();
        let staged = StagedCookies { path };
        tokio::fs::write(&staged.path, text).await?;
        debug!("staged cookies at {:?}", staged.path);

        Ok(Some(staged))
    }
}

/// A cookie file on disk; removed when dropped.
#[derive(Debug)]
pub struct StagedCookies {
    path: PathBuf,
}

impl StagedCookies {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedCookies {
    fn drop(&mut self) {
        unstage(&self.path);
    }
}

/// Deletes a staged cookie file; a file that is already gone is fine.
pub fn unstage(path: &Path) {
    discard_path(path.to_path_buf());
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{settled_entry_count, settled_removed};

    const NETSCAPE: &str = "# Netscape HTTP Cookie File\n.example.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";

    fn staging(dir: &TempDir) -> CookieStaging {
        CookieStaging::new(ScratchDir::new(dir.path().join("scratch")))
    }

    #[test]
    fn structural_check() {
        assert!(looks_like_cookie_file(NETSCAPE));
        assert!(looks_like_cookie_file(".example.com\tTRUE\t/\tFALSE\t0\tk\tv"));
        assert!(!looks_like_cookie_file("not cookies"));
        assert!(!looks_like_cookie_file("SID=abc; HSID=def"));
    }

    #[tokio::test]
    async fn invalid_or_missing_text_stages_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let staging = staging(&dir);

        assert!(staging.stage(Some("not cookies")).await.expect("stage").is_none());
        assert!(staging.stage(Some("   ")).await.expect("stage").is_none());
        assert!(staging.stage(None).await.expect("stage").is_none());
        assert!(!dir.path().join("scratch").exists());
    }

    #[tokio::test]
    async fn valid_cookies_are_written_and_removed_on_drop() {
        let dir = TempDir::new().expect("temp dir");
        let staging = staging(&dir);

        let staged = staging
            .stage(Some(&format!("  {NETSCAPE}  ")))
            .await
            .expect("stage")
            .expect("valid cookies");
        let path = staged.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).expect("read"), NETSCAPE.trim());

        drop(staged);
        assert!(settled_removed(&path).await);
        assert_eq!(settled_entry_count(&dir.path().join("scratch")).await, 0);
    }

    #[tokio::test]
    async fn unstage_tolerates_missing_file() {
        let dir = TempDir::new().expect("temp dir");
        let staged = staging(&dir)
            .stage(Some(NETSCAPE))
            .await
            .expect("stage")
            .expect("valid cookies");

        unstage(staged.path());
        assert!(settled_removed(staged.path()).await);
        drop(staged);
    }
}
