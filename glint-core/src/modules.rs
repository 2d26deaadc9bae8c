//! Source loading and import resolution.
//!
//! Imports resolve relative to the directory of the importing file and
//! are guarded by an active-inclusion stack: a file that is already
//! being parsed further up the stack is silently skipped rather than
//! reported, so mutual imports need no include guards.

use log::trace;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Tracks the active inclusion stack and the directory context for
/// resolving relative import paths. One loader serves one compilation
/// unit; construct a fresh one per compile.
#[derive(Debug, Default)]
pub struct ModuleLoader {
    /// Canonical paths of files currently being parsed.
    active: Vec<PathBuf>,
    /// Directory of each active file, innermost last.
    dirs: Vec<PathBuf>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        ModuleLoader::default()
    }

    /// Open the root file of a compilation unit. Returns the canonical
    /// path and the comment-stripped source; the caller must call
    /// [`end_import`] when parsing of the file completes.
    ///
    /// [`end_import`]: ModuleLoader::end_import
    pub fn begin_root(&mut self, path: &Path) -> io::Result<(PathBuf, String)> {
        let canonical = fs::canonicalize(path)?;
        let source = strip_comments(&fs::read_to_string(&canonical)?);
        self.push(canonical.clone());
        Ok((canonical, source))
    }

    /// Resolve and open an imported file. `Ok(None)` means the file is
    /// already on the active inclusion stack and the import is a no-op.
    pub fn begin_import(&mut self, spec: &str) -> io::Result<Option<(PathBuf, String)>> {
        let resolved = match self.dirs.last() {
            Some(dir) => dir.join(spec),
            None => PathBuf::from(spec),
        };
        let canonical = fs::canonicalize(&resolved)?;
        if self.active.contains(&canonical) {
            trace!("import cycle: {} already active, skipping", canonical.display());
            return Ok(None);
        }
        let source = strip_comments(&fs::read_to_string(&canonical)?);
        self.push(canonical.clone());
        Ok(Some((canonical, source)))
    }

    /// Pop the innermost file off the active stack once its statements
    /// have been parsed.
    pub fn end_import(&mut self) {
        self.active.pop();
        self.dirs.pop();
    }

    fn push(&mut self, canonical: PathBuf) {
        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.active.push(canonical);
        self.dirs.push(dir);
    }
}

/// Replace `//` line comments and `/* */` block comments with spaces.
/// The output has the same length as the input, so byte spans computed
/// against the stripped buffer line up with the original.
pub fn strip_comments(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_quote = false;

    while i < bytes.len() {
        if !in_quote && bytes[i] == b'/' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'/' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        out.push(b' ');
                        i += 1;
                    }
                    continue;
                }
                b'*' => {
                    out.push(b' ');
                    out.push(b' ');
                    i += 2;
                    while i < bytes.len() {
                        if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                            out.push(b' ');
                            out.push(b' ');
                            i += 2;
                            break;
                        }
                        out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                        i += 1;
                    }
                    continue;
                }
                _ => {}
            }
        }
        if bytes[i] == b'"' {
            in_quote = !in_quote;
        }
        out.push(bytes[i]);
        i += 1;
    }

    // Comments were replaced byte-for-byte, so this is still the same
    // UTF-8 outside the (ASCII) replaced regions.
    String::from_utf8(out).unwrap_or_else(|_| src.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_comments_become_spaces() {
        let src = "float a; // trailing\nfloat b;";
        let out = strip_comments(src);
        assert_eq!(out.len(), src.len());
        assert!(out.contains("float a;"));
        assert!(out.contains("float b;"));
        assert!(!out.contains("trailing"));
    }

    #[test]
    fn test_block_comments_preserve_newlines() {
        let src = "a /* one\ntwo */ b";
        let out = strip_comments(src);
        assert_eq!(out.len(), src.len());
        assert_eq!(out.matches('\n').count(), 1);
        assert!(!out.contains("one"));
        assert!(out.starts_with('a'));
        assert!(out.ends_with('b'));
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let src = "import\"dir//file.gl\"";
        let out = strip_comments(src);
        assert_eq!(out, src);
    }

    #[test]
    fn test_unterminated_block_comment_runs_to_end() {
        let src = "a /* never closed";
        let out = strip_comments(src);
        assert_eq!(out.len(), src.len());
        assert!(out.starts_with('a'));
        assert!(!out.contains("closed"));
    }
}
