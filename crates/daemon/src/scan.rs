//! Scanner module for discovering video files to submit as a batch.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Video file extensions recognised by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v", ".3gp", ".ts", ".mpg", ".mpeg",
];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Recursively collects video files under `root`, sorted by path.
///
/// Hidden directories (names starting with `.`) below the root are skipped.
/// Fails only if `root` itself is not a readable directory; unreadable
/// entries further down are ignored.
pub fn scan_directory(root: &Path) -> io::Result<Vec<PathBuf>> {
    if !std::fs::metadata(root)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        ));
    }

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() && entry.depth() > 0 {
            if let Some(name) = entry.file_name().to_str() {
                return !name.starts_with('.');
            }
        }
        true
    });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_file() && is_video_file(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV")));
        assert!(is_video_file(Path::new("/media/clip.3gp")));
        assert!(is_video_file(Path::new("/media/clip.Mpeg")));
        assert!(!is_video_file(Path::new("/media/movie.m2ts")));
        assert!(!is_video_file(Path::new("/media/movie.srt")));
        assert!(!is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b/season1")).unwrap();
        File::create(root.join("b/season1/e02.mkv")).unwrap();
        File::create(root.join("b/season1/e01.mkv")).unwrap();
        File::create(root.join("a.mp4")).unwrap();
        File::create(root.join("notes.txt")).unwrap();
        // extension check applies to files only
        fs::create_dir_all(root.join("folder.mp4")).unwrap();

        let files = scan_directory(root).unwrap();

        assert_eq!(
            files,
            vec![
                root.join("a.mp4"),
                root.join("b/season1/e01.mkv"),
                root.join("b/season1/e02.mkv"),
            ]
        );
    }

    #[test]
    fn test_scan_rejects_missing_or_file_root() {
        let temp_dir = TempDir::new().unwrap();
        assert!(scan_directory(&temp_dir.path().join("missing")).is_err());

        let file = temp_dir.path().join("movie.mp4");
        File::create(&file).unwrap();
        assert_eq!(
            scan_directory(&file).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("mp4"), Just("Mp4"),
                Just("webm"), Just("WMV"), Just("flv"), Just("ts"),
                Just("mpg"), Just("MPEG"), Just("3gp"), Just("m4v"),
                Just("txt"), Just("jpg"), Just("srt"), Just("m2ts"),
                Just("nfo"), Just("part"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let expected = matches!(
                ext.to_lowercase().as_str(),
                "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "3gp" | "ts" | "mpg" | "mpeg"
            );
            prop_assert_eq!(is_video_file(&path), expected);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_hidden_directory_exclusion(
            visible_dir in "[a-zA-Z0-9]{1,10}",
            hidden_dir in "\\.[a-zA-Z0-9]{1,10}",
            filename in "[a-zA-Z0-9]{1,10}",
        ) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();

            let visible_video = root.join(&visible_dir).join(format!("{}.mkv", filename));
            fs::create_dir_all(visible_video.parent().unwrap()).unwrap();
            File::create(&visible_video).unwrap();

            let hidden_video = root.join(&hidden_dir).join(format!("{}.mkv", filename));
            fs::create_dir_all(hidden_video.parent().unwrap()).unwrap();
            File::create(&hidden_video).unwrap();

            let files = scan_directory(root).unwrap();

            prop_assert!(files.contains(&visible_video));
            prop_assert!(!files.contains(&hidden_video));
        }
    }
}
