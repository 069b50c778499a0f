//! C3 Workspace Service: path-safe file access rooted at a session's
//! workspace directory, using `axum`'s documented `Multipart` extractor for
//! uploads, consistent with the axum-first approach used for every other
//! HTTP surface in this codebase.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use forge_protocol::CoreError;

/// One entry of a recursive, pre-order directory listing. Directories
/// appear before their children.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TreeEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum Preview {
    Csv { rows: Vec<Vec<String>> },
    Text { content: String, truncated: bool },
    Image { url: String },
    Pdf { url: String },
    Binary,
}

const TEXT_PREVIEW_LIMIT: usize = 100_000;
const CSV_PREVIEW_ROWS: usize = 100;

/// Resolve `rel_path` against `workspace_root`, rejecting any resolution
/// that doesn't land strictly within the root. Canonicalizes both sides
/// rather than relying on string prefix checks, which a `../` segment or a
/// symlink could defeat.
pub fn resolve(workspace_root: &Path, rel_path: &str) -> Result<PathBuf, CoreError> {
    if Path::new(rel_path).is_absolute() {
        return Err(CoreError::InvalidPath(rel_path.to_string()));
    }
    let joined = workspace_root.join(rel_path);
    let root_canon = workspace_root
        .canonicalize()
        .map_err(|_| CoreError::InvalidPath(rel_path.to_string()))?;

    // The target need not exist yet (writes create it); canonicalize the
    // deepest existing ancestor and re-append the remaining components so
    // `..` traversal is still caught before the file is created.
    let mut existing = joined.clone();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing = existing
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root_canon.clone());
            }
            None => break,
        }
    }
    let mut canon = existing
        .canonicalize()
        .map_err(|_| CoreError::InvalidPath(rel_path.to_string()))?;
    for component in tail.into_iter().rev() {
        canon.push(component);
    }

    if !canon.starts_with(&root_canon) {
        return Err(CoreError::InvalidPath(rel_path.to_string()));
    }
    Ok(canon)
}

/// Recursive pre-order listing; hidden entries (leading `.`) are skipped,
/// the same predicate the watcher registry uses (§9 "hidden-file policy").
pub fn tree(workspace_root: &Path) -> Result<Vec<TreeEntry>, CoreError> {
    let mut out = Vec::new();
    if workspace_root.exists() {
        walk(workspace_root, workspace_root, &mut out)?;
    }
    Ok(out)
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// The same dotfile-skip predicate applied to a whole relative path,
/// shared with the Watcher Registry (C4) so a file invisible in the tree
/// never surfaces as a watcher notification either.
pub fn is_hidden_path(rel: &str) -> bool {
    rel.split('/').any(is_hidden)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<TreeEntry>) -> Result<(), CoreError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| CoreError::NotFound(e.to_string()))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        // Skip symlinks that escape the workspace root rather than
        // following them during the walk.
        if path.is_symlink() {
            match path.canonicalize() {
                Ok(target) if target.starts_with(root) => {}
                _ => continue,
            }
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let mtime = mtime_secs(&meta);
        if meta.is_dir() {
            out.push(TreeEntry {
                name: name.clone(),
                path: rel,
                size: 0,
                mtime,
                kind: EntryKind::Directory,
            });
            walk(root, &path, out)?;
        } else {
            out.push(TreeEntry {
                name,
                path: rel,
                size: meta.len(),
                mtime,
                kind: EntryKind::File,
            });
        }
    }
    Ok(())
}

pub fn read(workspace_root: &Path, rel_path: &str) -> Result<Vec<u8>, CoreError> {
    let path = resolve(workspace_root, rel_path)?;
    std::fs::read(&path).map_err(|_| CoreError::NotFound(rel_path.to_string()))
}

/// Writes `bytes` to `rel_path`, creating missing parent directories. If
/// `expected_mtime` is supplied and differs from the current on-disk
/// mtime, fails with `Conflict` and performs no write. Returns the
/// post-write mtime.
pub fn write(
    workspace_root: &Path,
    rel_path: &str,
    bytes: &[u8],
    expected_mtime: Option<i64>,
) -> Result<i64, CoreError> {
    let path = resolve(workspace_root, rel_path)?;

    if let Some(expected) = expected_mtime {
        if let Ok(meta) = std::fs::metadata(&path) {
            let current = mtime_secs(&meta);
            if current != expected {
                return Err(CoreError::Conflict {
                    server_mtime: current,
                });
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::SpawnError(e.to_string()))?;
    }
    std::fs::write(&path, bytes).map_err(|e| CoreError::SpawnError(e.to_string()))?;
    let meta = std::fs::metadata(&path).map_err(|e| CoreError::SpawnError(e.to_string()))?;
    Ok(mtime_secs(&meta))
}

pub fn delete(workspace_root: &Path, rel_path: &str) -> Result<(), CoreError> {
    let path = resolve(workspace_root, rel_path)?;
    if !path.exists() {
        return Err(CoreError::NotFound(rel_path.to_string()));
    }
    if path.is_dir() {
        std::fs::remove_dir_all(&path)
    } else {
        std::fs::remove_file(&path)
    }
    .map_err(|e| CoreError::SpawnError(e.to_string()))
}

pub fn preview(workspace_root: &Path, rel_path: &str) -> Result<Preview, CoreError> {
    let path = resolve(workspace_root, rel_path)?;
    if !path.exists() {
        return Err(CoreError::NotFound(rel_path.to_string()));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" => {
            let content = std::fs::read_to_string(&path).map_err(|e| CoreError::SpawnError(e.to_string()))?;
            let rows: Vec<Vec<String>> = split_csv_lines(&content)
                .into_iter()
                .take(CSV_PREVIEW_ROWS)
                .map(|line| parse_csv_line(&line))
                .collect();
            Ok(Preview::Csv { rows })
        }
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" => Ok(Preview::Image {
            url: format!("/api/files/{rel_path}"),
        }),
        "pdf" => Ok(Preview::Pdf {
            url: format!("/api/files/{rel_path}"),
        }),
        _ => {
            let bytes = std::fs::read(&path).map_err(|e| CoreError::SpawnError(e.to_string()))?;
            match String::from_utf8(bytes[..bytes.len().min(TEXT_PREVIEW_LIMIT)].to_vec()) {
                Ok(content) => Ok(Preview::Text {
                    truncated: bytes.len() > TEXT_PREVIEW_LIMIT,
                    content,
                }),
                Err(_) => Ok(Preview::Binary),
            }
        }
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Derive an upload's destination relative path from an optional
/// subdirectory field plus the uploaded filename. The caller still must
/// run the result through `resolve` for the prefix check — this only
/// builds the candidate path.
pub fn upload_destination(subdir: Option<&str>, filename: &str) -> String {
    match subdir {
        Some(sub) if !sub.is_empty() => format!("{}/{}", sub.trim_matches('/'), filename),
        _ => filename.to_string(),
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Split raw CSV text into logical lines, respecting quoted newlines: a
/// newline inside an open (odd count of unescaped) quote doesn't end the
/// line.
fn split_csv_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            '\n' if !in_quotes => {
                lines.push(std::mem::take(&mut current));
            }
            '\r' if !in_quotes => {}
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Hand-rolled CSV line tokenizer for a small bespoke dialect:
/// comma-separated; values may be double-quoted (commas/newlines literal
/// inside quotes, `""` escapes a quote); unquoted values are
/// whitespace-trimmed; a bare comma outside quotes terminates the field; a
/// line with no commas yields one field; empty input yields `[""]`.
pub fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => {
                in_quotes = true;
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field).trim().to_string());
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn csv_empty_input_yields_single_empty_field() {
        assert_eq!(parse_csv_line(""), vec![""]);
    }

    #[test]
    fn csv_no_commas_yields_one_field() {
        assert_eq!(parse_csv_line("hello"), vec!["hello"]);
    }

    #[test]
    fn csv_basic_split_and_trim() {
        assert_eq!(parse_csv_line("a, b ,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn csv_quoted_comma_is_literal() {
        assert_eq!(parse_csv_line(r#""a,b",c"#), vec!["a,b", "c"]);
    }

    #[test]
    fn csv_escaped_quote_inside_quoted_field() {
        assert_eq!(parse_csv_line(r#""a""b",c"#), vec![r#"a"b"#, "c"]);
    }

    #[test]
    fn csv_quoted_newline_stays_one_logical_line() {
        let content = "\"a\nb\",c\nd,e";
        let lines = split_csv_lines(content);
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_csv_line(&lines[0]), vec!["a\nb", "c"]);
        assert_eq!(parse_csv_line(&lines[1]), vec!["d", "e"]);
    }

    #[test]
    fn path_resolve_rejects_absolute() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve(dir.path(), "/etc/passwd"),
            Err(CoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn path_resolve_rejects_escape() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve(dir.path(), "../../etc/passwd"),
            Err(CoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn path_resolve_allows_new_nested_file() {
        let dir = tempdir().unwrap();
        let resolved = resolve(dir.path(), "a/b/c.txt").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", b"hello", None).unwrap();
        assert_eq!(read(dir.path(), "a.txt").unwrap(), b"hello");
    }

    #[test]
    fn write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        write(dir.path(), "nested/dir/a.txt", b"hi", None).unwrap();
        assert_eq!(read(dir.path(), "nested/dir/a.txt").unwrap(), b"hi");
    }

    #[test]
    fn write_conflict_on_stale_mtime_leaves_file_unchanged() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.txt", b"v1", None).unwrap();
        let err = write(dir.path(), "a.txt", b"v2", Some(0)).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(read(dir.path(), "a.txt").unwrap(), b"v1");
    }

    #[test]
    fn delete_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(delete(dir.path(), "nope.txt"), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn tree_skips_hidden_entries_and_lists_dirs_before_children() {
        let dir = tempdir().unwrap();
        write(dir.path(), "sub/file.txt", b"x", None).unwrap();
        write(dir.path(), ".hidden", b"x", None).unwrap();
        let entries = tree(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(!names.contains(&".hidden"));
        let sub_idx = names.iter().position(|n| *n == "sub").unwrap();
        let file_idx = names.iter().position(|n| *n == "file.txt").unwrap();
        assert!(sub_idx < file_idx);
    }

    #[test]
    fn preview_csv_parses_rows() {
        let dir = tempdir().unwrap();
        write(dir.path(), "data.csv", b"a,b\n1,2\n", None).unwrap();
        match preview(dir.path(), "data.csv").unwrap() {
            Preview::Csv { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec!["a", "b"]);
            }
            other => panic!("expected Csv, got {other:?}"),
        }
    }

    #[test]
    fn preview_text_file_returns_content() {
        let dir = tempdir().unwrap();
        write(dir.path(), "notes.txt", b"hello world", None).unwrap();
        match preview(dir.path(), "notes.txt").unwrap() {
            Preview::Text { content, truncated } => {
                assert_eq!(content, "hello world");
                assert!(!truncated);
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn preview_binary_non_utf8_file() {
        let dir = tempdir().unwrap();
        write(dir.path(), "blob.dat", &[0xff, 0xfe, 0x00, 0x01], None).unwrap();
        assert!(matches!(preview(dir.path(), "blob.dat").unwrap(), Preview::Binary));
    }
}
