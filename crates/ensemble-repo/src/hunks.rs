//! Hunk application with context verification
//!
//! Every context (`' '`) and deletion (`'-'`) line must match the working
//! file at its projected index, where the projection accounts for the
//! cumulative line-count delta of earlier hunks. A mismatch aborts the op so
//! the caller can fall back to whole-file content or fail.

use crate::spec::Hunk;

/// Hunk application failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HunkError {
    #[error(
        "hunk {hunk} mismatch at line {line}: expected {expected:?}, found {found:?}"
    )]
    Mismatch {
        /// 0-based hunk index within the op
        hunk: usize,
        /// 1-based line number in the current file
        line: usize,
        expected: String,
        found: Option<String>,
    },

    #[error("hunk {hunk} starts at line {start} but the file has {len} lines")]
    OutOfRange { hunk: usize, start: usize, len: usize },
}

/// Apply `hunks` to `original`, returning the new content.
///
/// Hunks are applied in order against the evolving file; `old_start` always
/// refers to the original file's numbering, so later hunks are shifted by the
/// net insertions/removals of earlier ones.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, HunkError> {
    let had_trailing_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(String::from).collect();
    let mut offset: i64 = 0;

    for (hunk_index, hunk) in hunks.iter().enumerate() {
        let projected = hunk.old_start as i64 - 1 + offset;
        if projected < 0 || projected as usize > lines.len() {
            return Err(HunkError::OutOfRange {
                hunk: hunk_index,
                start: hunk.old_start,
                len: lines.len(),
            });
        }
        let mut cursor = projected as usize;

        for raw in &hunk.lines {
            let (prefix, text) = split_prefix(raw);
            match prefix {
                '+' => {
                    lines.insert(cursor, text.to_string());
                    cursor += 1;
                    offset += 1;
                }
                '-' => {
                    let found = lines.get(cursor).cloned();
                    if found.as_deref() != Some(text) {
                        return Err(HunkError::Mismatch {
                            hunk: hunk_index,
                            line: cursor + 1,
                            expected: text.to_string(),
                            found,
                        });
                    }
                    lines.remove(cursor);
                    offset -= 1;
                }
                // ' ' and any unrecognized prefix are context
                _ => {
                    let found = lines.get(cursor).cloned();
                    if found.as_deref() != Some(text) {
                        return Err(HunkError::Mismatch {
                            hunk: hunk_index,
                            line: cursor + 1,
                            expected: text.to_string(),
                            found,
                        });
                    }
                    cursor += 1;
                }
            }
        }
    }

    let mut result = lines.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

/// Split a hunk line into its marker and text. An empty line counts as empty
/// context.
fn split_prefix(raw: &str) -> (char, &str) {
    let mut chars = raw.chars();
    match chars.next() {
        Some(prefix) => (prefix, &raw[prefix.len_utf8()..]),
        None => (' ', ""),
    }
}
