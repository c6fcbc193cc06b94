//! Content preview for the right-hand pane. Text files get a head of their
//! lines, binaries a sniffed type description, directories a short entry
//! listing. The core only hands over bytes; everything here is presentation.

use std::path::Path;

use content_inspector::ContentType;

use crate::nav::Navigator;
use crate::probe::FsError;

const PREVIEW_MAX_BYTES: usize = 8 * 1024;
const PREVIEW_MAX_LINES: usize = 80;
const PREVIEW_DIR_ENTRIES: usize = 12;

#[derive(Clone)]
pub struct PreviewPane {
    pub title: String,
    pub body: String,
}

impl PreviewPane {
    fn new<T: Into<String>, B: Into<String>>(title: T, body: B) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new("Preview", "Nothing selected")
    }

    pub fn loading() -> Self {
        Self::new("Preview", "Loading preview...")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Preview", message)
    }
}

pub fn build(nav: &Navigator, path: &Path, is_dir: bool) -> PreviewPane {
    if is_dir {
        return preview_directory(path);
    }
    preview_file(nav, path)
}

// Directory preview probes directly: it is a throwaway head listing, not
// tree state worth caching.
fn preview_directory(path: &Path) -> PreviewPane {
    match crate::probe::list_directory(path) {
        Err(err) => PreviewPane::error(format!("Preview not available: {err}")),
        Ok(listing) => {
            let total = listing.entries.len();
            let mut rows: Vec<String> = listing
                .entries
                .iter()
                .take(PREVIEW_DIR_ENTRIES)
                .map(|entry| {
                    format!(
                        "{} {}",
                        if entry.is_dir_like() { "[D]" } else { "[F]" },
                        entry.name
                    )
                })
                .collect();
            if rows.is_empty() {
                return PreviewPane::new("Preview", "Directory is empty");
            }
            if total > PREVIEW_DIR_ENTRIES {
                rows.push("...".into());
            }
            PreviewPane::new("Preview", rows.join("\n"))
        }
    }
}

fn preview_file(nav: &Navigator, path: &Path) -> PreviewPane {
    let buffer = match nav.current_file_content(path) {
        Ok(bytes) => bytes,
        Err(FsError::NotAFile(_)) => {
            return PreviewPane::error("Not a regular file");
        }
        Err(err) => return PreviewPane::error(format!("Preview not available: {err}")),
    };
    if buffer.is_empty() {
        return PreviewPane::new("Preview", "<empty file>");
    }
    let head = &buffer[..buffer.len().min(PREVIEW_MAX_BYTES)];
    if is_text_data(head) {
        let mut body = String::new();
        for (idx, line) in String::from_utf8_lossy(head).lines().enumerate() {
            if idx >= PREVIEW_MAX_LINES {
                body.push_str("\n...");
                break;
            }
            if idx > 0 {
                body.push('\n');
            }
            body.push_str(line);
        }
        return PreviewPane::new("Preview", body);
    }
    PreviewPane::new(
        "Preview",
        format!("Non-text file\nType: {}", describe_file_type(path)),
    )
}

fn is_text_data(buffer: &[u8]) -> bool {
    !matches!(content_inspector::inspect(buffer), ContentType::BINARY)
}

fn describe_file_type(path: &Path) -> String {
    match infer::get_from_path(path) {
        Ok(Some(kind)) => format!("{} ({})", kind.mime_type(), kind.extension()),
        Ok(None) | Err(_) => "Unknown type".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::runtime::Runtime;

    use crate::probe::FsDispatcher;

    fn navigator(tmp: &TempDir) -> (Navigator, Runtime) {
        let runtime = Runtime::new().unwrap();
        let (fs_dispatcher, _rx) = FsDispatcher::new(&runtime);
        let nav = Navigator::new(fs_dispatcher, tmp.path().to_path_buf());
        (nav, runtime)
    }

    #[test]
    fn empty_file_gets_a_placeholder_body() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("empty.txt");
        fs::write(&file, b"").unwrap();
        let (nav, _runtime) = navigator(&tmp);

        let pane = build(&nav, &file, false);
        assert_eq!(pane.body, "<empty file>");
    }

    #[test]
    fn binary_content_is_described_not_dumped() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("blob.bin");
        fs::write(&file, [0u8, 159, 146, 150, 0, 255]).unwrap();
        let (nav, _runtime) = navigator(&tmp);

        let pane = build(&nav, &file, false);
        assert!(pane.body.starts_with("Non-text file"));
    }

    #[test]
    fn text_content_shows_a_head_of_lines() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("poem.txt");
        fs::write(&file, b"first line\nsecond line\n").unwrap();
        let (nav, _runtime) = navigator(&tmp);

        let pane = build(&nav, &file, false);
        assert_eq!(pane.body, "first line\nsecond line");
    }

    #[test]
    fn missing_file_reports_the_failure() {
        let tmp = TempDir::new().unwrap();
        let (nav, _runtime) = navigator(&tmp);

        let pane = build(&nav, &tmp.path().join("gone.txt"), false);
        assert!(pane.body.starts_with("Preview not available"));
    }

    #[test]
    fn non_regular_entry_gets_the_file_fallback() {
        let tmp = TempDir::new().unwrap();
        let (nav, _runtime) = navigator(&tmp);

        // A directory handed down the file path must not be opened.
        let pane = build(&nav, tmp.path(), false);
        assert_eq!(pane.body, "Not a regular file");
    }

    #[test]
    fn directory_preview_lists_a_head_of_entries() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("a.txt"), b"x").unwrap();

        let pane = preview_directory(tmp.path());
        assert_eq!(pane.body, "[D] sub\n[F] a.txt");

        let empty = TempDir::new().unwrap();
        assert_eq!(preview_directory(empty.path()).body, "Directory is empty");
    }
}
