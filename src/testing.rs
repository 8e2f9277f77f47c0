//! Fake yt-dlp executables for tests. Scripts run through `sh`, so nothing
//! has to be marked executable.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::ytdlp::ToolConfig;

/// Leaves the `-o` argument in `$out` and consumes all other arguments.
pub const OUTPUT_ARG_PRELUDE: &str = r#"out=""
for arg in "$@"; do
  case "$arg" in
    --cookies) echo "cookies flag present" >&2 ;;
  esac
done
while [ "$#" -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
"#;

pub fn fake_tool(dir: &Path, script: &str) -> ToolConfig {
    let path = dir.join(format!("fake-yt-dlp-{}.sh", uuid::Uuid::new_v4().simple()));
    std::fs::write(&path, script).expect("write fake yt-dlp script");

    ToolConfig {
        program: PathBuf::from("sh"),
        leading_args: vec![path.to_string_lossy().into_owned()],
        js_runtime: None,
        ffmpeg_location: None,
    }
}

/// A download script: prelude followed by `body`, which may use `$out`.
pub fn fake_download_tool(dir: &Path, body: &str) -> ToolConfig {
    fake_tool(dir, &format!("{OUTPUT_ARG_PRELUDE}{body}"))
}

pub fn entry_count(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Waits for background removals to empty `dir`, then returns what is left.
pub async fn settled_entry_count(dir: &Path) -> usize {
    for _ in 0..200 {
        if entry_count(dir) == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    entry_count(dir)
}

/// Waits for a background removal of `path`; true once it is gone.
pub async fn settled_removed(path: &Path) -> bool {
    for _ in 0..200 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    !path.exists()
}
