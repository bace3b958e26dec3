//! Line-level access to materialized JSONL files.
//!
//! Output files run to tens of gigabytes, so everything here streams through a
//! `BufReader` and never holds more than one line in memory.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
pub enum JsonlError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("line {line} of {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> JsonlError + '_ {
    move |source| JsonlError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn open(path: &Path) -> Result<BufReader<File>, JsonlError> {
    File::open(path).map(BufReader::new).map_err(io_err(path))
}

/// Parse line `n` (0-based). `None` if the file has fewer lines.
pub fn read_line(path: &Path, n: usize) -> Result<Option<JsonValue>, JsonlError> {
    let reader = open(path)?;
    let Some(line) = reader.lines().nth(n) else {
        return Ok(None);
    };
    let line = line.map_err(io_err(path))?;
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|source| JsonlError::Parse {
            path: path.display().to_string(),
            line: n,
            source,
        })
}

/// Copy the first `n` lines of `src` to `dst` verbatim. Returns the number copied.
pub fn copy_head(src: &Path, dst: &Path, n: usize) -> Result<usize, JsonlError> {
    let reader = open(src)?;
    let mut writer = BufWriter::new(File::create(dst).map_err(io_err(dst))?);
    let mut copied = 0;
    for line in reader.lines().take(n) {
        let line = line.map_err(io_err(src))?;
        writeln!(writer, "{line}").map_err(io_err(dst))?;
        copied += 1;
    }
    writer.flush().map_err(io_err(dst))?;
    Ok(copied)
}

/// Number of non-empty lines.
pub fn count_lines(path: &Path) -> Result<usize, JsonlError> {
    let mut reader = open(path)?;
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut count = 0;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Copy of `value` with every array longer than `keep` cut down to its first
/// `keep` elements followed by a `"... and N more ..."` marker string.
pub fn truncate_lists(value: &JsonValue, keep: usize) -> JsonValue {
    match value {
        JsonValue::Array(items) => {
            let mut out: Vec<JsonValue> = items
                .iter()
                .take(keep)
                .map(|item| truncate_lists(item, keep))
                .collect();
            if items.len() > keep {
                out.push(JsonValue::String(format!(
                    "... and {} more ...",
                    items.len() - keep
                )));
            }
            JsonValue::Array(out)
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_lists(v, keep)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("trees.jsonl");
        std::fs::write(
            &path,
            "{\"user_id\":1,\"events\":[]}\n{\"user_id\":2,\"events\":[1,2]}\n\n{\"user_id\":3}\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn read_line_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        assert_eq!(read_line(&path, 1).unwrap(), Some(json!({"user_id": 2, "events": [1, 2]})));
        assert_eq!(read_line(&path, 10).unwrap(), None);
    }

    #[test]
    fn read_line_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"ok\":1}\n{not json\n").unwrap();
        let err = read_line(&path, 1).unwrap_err();
        assert!(matches!(err, JsonlError::Parse { line: 1, .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = count_lines(&dir.path().join("nope.jsonl")).unwrap_err();
        assert!(matches!(err, JsonlError::Io { .. }));
    }

    #[test]
    fn count_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_file(dir.path());
        assert_eq!(count_lines(&path).unwrap(), 3);
    }

    #[test]
    fn copy_head_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_file(dir.path());
        let dst = dir.path().join("head.jsonl");
        assert_eq!(copy_head(&src, &dst, 2).unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(&dst).unwrap(),
            "{\"user_id\":1,\"events\":[]}\n{\"user_id\":2,\"events\":[1,2]}\n"
        );
        // Asking for more than exists copies everything.
        assert_eq!(copy_head(&src, &dst, 100).unwrap(), 4);
    }

    #[test]
    fn truncation_marks_dropped_tail() {
        let doc = json!({
            "id": 1,
            "posts": [
                {"votes": [1, 2, 3, 4]},
                {"votes": []},
                {"votes": [5]}
            ]
        });
        let cut = truncate_lists(&doc, 2);
        assert_eq!(
            cut,
            json!({
                "id": 1,
                "posts": [
                    {"votes": [1, 2, "... and 2 more ..."]},
                    {"votes": []},
                    "... and 1 more ..."
                ]
            })
        );
        assert_eq!(truncate_lists(&doc, 10), doc);
    }
}
