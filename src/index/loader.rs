use std::path::Path;

use anyhow::{bail, Context, Result};

/// Load one document into plain text, dispatching on extension.
///
/// Text-adjacent formats read directly; PDFs go through text extraction.
/// Unknown extensions get the text loader as a last resort — binary garbage
/// fails UTF-8 heuristics and surfaces as an error, which callers treat as
/// "skip with a warning".
pub fn load_document(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => load_pdf(path),
        "csv" | "tsv" => load_text(path),
        "txt" | "md" | "markdown" | "rst" | "org" | "json" | "toml" | "yaml" | "yml" | "html"
        | "htm" | "log" => load_text(path),
        _ => {
            // Unknown extension: try the text loader before giving up.
            load_text(path)
        }
    }
}

fn load_text(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    // Reject obviously binary payloads rather than indexing mojibake.
    let sample = &bytes[..bytes.len().min(4096)];
    if sample.contains(&0u8) {
        bail!("{} looks binary, skipping", path.display());
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn load_pdf(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path)
        .map_err(|e| anyhow::anyhow!("pdf extraction failed for {}: {e}", path.display()))
}

/// Hidden files and directories (dot-prefixed anywhere in the path below the
/// indexed root) are excluded from indexing.
pub fn is_hidden(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .map(|s| s.starts_with('.'))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Recursively collect indexable files under `root`, skipping hidden entries.
pub fn walk_folder(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if is_hidden(&path, root) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn text_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        fs::write(&path, "# heading\n\nbody text").unwrap();
        assert_eq!(load_document(&path).unwrap(), "# heading\n\nbody text");
    }

    #[test]
    fn binary_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, [0u8, 159, 146, 150]).unwrap();
        assert!(load_document(&path).is_err());
    }

    #[test]
    fn hidden_paths_are_detected() {
        let root = Path::new("/data/docs");
        assert!(is_hidden(Path::new("/data/docs/.git/config"), root));
        assert!(is_hidden(Path::new("/data/docs/sub/.hidden.txt"), root));
        assert!(!is_hidden(Path::new("/data/docs/sub/plain.txt"), root));
    }

    #[test]
    fn walk_skips_hidden_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        fs::write(dir.path().join(".cache/c.txt"), "c").unwrap();
        fs::write(dir.path().join(".hidden.txt"), "h").unwrap();

        let files = walk_folder(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
    }
}
