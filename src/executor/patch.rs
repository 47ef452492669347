/// Minimal unified-diff support: extraction of fenced diff blocks from
/// agent transcripts, strict parsing, and in-memory application. Hunks are
/// applied at their stated positions; any context mismatch rejects the
/// whole diff rather than fuzzy-matching.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// The path this diff touches, with `a/`/`b/` prefixes stripped.
    pub fn target_path(&self) -> &str {
        let raw = if self.new_path == "/dev/null" {
            &self.old_path
        } else {
            &self.new_path
        };
        raw.strip_prefix("a/")
            .or_else(|| raw.strip_prefix("b/"))
            .unwrap_or(raw)
    }

    pub fn creates_file(&self) -> bool {
        self.old_path == "/dev/null"
    }

    pub fn deletes_file(&self) -> bool {
        self.new_path == "/dev/null"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// Pull fenced ```diff blocks with a recognizable `---`/`+++` header out of
/// a transcript, in order of appearance.
pub fn extract_diff_blocks(transcript: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in transcript.lines() {
        let trimmed = line.trim_end();
        match &mut current {
            None => {
                if trimmed == "```diff" {
                    current = Some(String::new());
                }
            }
            Some(block) => {
                if trimmed == "```" {
                    if block.contains("--- ") && block.contains("+++ ") {
                        blocks.push(block.clone());
                    }
                    current = None;
                } else {
                    block.push_str(line);
                    block.push('\n');
                }
            }
        }
    }
    blocks
}

pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>, String> {
    let mut diffs: Vec<FileDiff> = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if let Some(old_path) = line.strip_prefix("--- ") {
            let Some(new_line) = lines.next() else {
                return Err("diff ends after `---` header".to_string());
            };
            let Some(new_path) = new_line.strip_prefix("+++ ") else {
                return Err(format!("expected `+++` header after `--- {old_path}`"));
            };
            let mut diff = FileDiff {
                old_path: old_path.trim().to_string(),
                new_path: new_path.trim().to_string(),
                hunks: Vec::new(),
            };
            while lines.peek().is_some_and(|line| line.starts_with("@@")) {
                let Some(header) = lines.next() else { break };
                let mut hunk = parse_hunk_header(header)?;
                while let Some(&body) = lines.peek() {
                    let parsed = match body.chars().next() {
                        Some(' ') => Some(HunkLine::Context(body[1..].to_string())),
                        Some('-') if !body.starts_with("---") => {
                            Some(HunkLine::Remove(body[1..].to_string()))
                        }
                        Some('+') if !body.starts_with("+++") => {
                            Some(HunkLine::Add(body[1..].to_string()))
                        }
                        Some('\\') => {
                            // "\ No newline at end of file"
                            lines.next();
                            continue;
                        }
                        None => Some(HunkLine::Context(String::new())),
                        _ => None,
                    };
                    match parsed {
                        Some(hunk_line) => {
                            hunk.lines.push(hunk_line);
                            lines.next();
                        }
                        None => break,
                    }
                }
                if hunk.lines.is_empty() {
                    return Err(format!("hunk `{header}` has no body"));
                }
                diff.hunks.push(hunk);
            }
            if diff.hunks.is_empty() {
                return Err(format!(
                    "diff for `{}` contains no hunks",
                    diff.target_path()
                ));
            }
            diffs.push(diff);
        }
    }

    if diffs.is_empty() {
        return Err("no file diffs found".to_string());
    }
    Ok(diffs)
}

fn parse_hunk_header(header: &str) -> Result<Hunk, String> {
    // @@ -old_start,old_count +new_start,new_count @@
    let inner = header
        .trim_start_matches('@')
        .trim_end_matches(|ch: char| ch != '@')
        .trim_matches('@')
        .trim();
    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| format!("malformed hunk header `{header}`"))?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| format!("malformed hunk header `{header}`"))?;
    let (old_start, old_count) = parse_range(old, header)?;
    let (new_start, new_count) = parse_range(new, header)?;
    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
    })
}

fn parse_range(range: &str, header: &str) -> Result<(usize, usize), String> {
    let (start, count) = match range.split_once(',') {
        Some((start, count)) => (start, count),
        None => (range, "1"),
    };
    let start = start
        .parse::<usize>()
        .map_err(|_| format!("malformed hunk header `{header}`"))?;
    let count = count
        .parse::<usize>()
        .map_err(|_| format!("malformed hunk header `{header}`"))?;
    Ok((start, count))
}

/// Apply one file diff to `original`, producing the new contents. Strict:
/// every context and removal line must match the original exactly at the
/// position the hunk names.
pub fn apply_file_diff(original: &str, diff: &FileDiff) -> Result<String, String> {
    if diff.creates_file() {
        let mut content = String::new();
        for hunk in &diff.hunks {
            for line in &hunk.lines {
                match line {
                    HunkLine::Add(text) => {
                        content.push_str(text);
                        content.push('\n');
                    }
                    _ => return Err("new-file diff contains non-addition lines".to_string()),
                }
            }
        }
        return Ok(content);
    }

    let had_trailing_newline = original.ends_with('\n') || original.is_empty();
    let old_lines: Vec<&str> = original.lines().collect();
    let mut new_lines: Vec<String> = Vec::with_capacity(old_lines.len());
    let mut cursor = 0usize; // 0-based index into old_lines

    for hunk in &diff.hunks {
        let hunk_start = hunk.old_start.saturating_sub(1);
        if hunk_start < cursor {
            return Err(format!(
                "hunk at line {} overlaps a previously applied hunk",
                hunk.old_start
            ));
        }
        if hunk_start > old_lines.len() {
            return Err(format!(
                "hunk at line {} starts past end of file ({} lines)",
                hunk.old_start,
                old_lines.len()
            ));
        }
        new_lines.extend(old_lines[cursor..hunk_start].iter().map(|s| s.to_string()));
        cursor = hunk_start;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    let actual = old_lines.get(cursor).copied().unwrap_or_default();
                    if actual != text {
                        return Err(format!(
                            "context mismatch at line {}: expected `{text}`, found `{actual}`",
                            cursor + 1
                        ));
                    }
                    new_lines.push(text.clone());
                    cursor += 1;
                }
                HunkLine::Remove(text) => {
                    let actual = old_lines.get(cursor).copied().unwrap_or_default();
                    if actual != text {
                        return Err(format!(
                            "removal mismatch at line {}: expected `{text}`, found `{actual}`",
                            cursor + 1
                        ));
                    }
                    cursor += 1;
                }
                HunkLine::Add(text) => {
                    new_lines.push(text.clone());
                }
            }
        }
    }
    new_lines.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    if diff.deletes_file() && new_lines.is_empty() {
        return Ok(String::new());
    }

    let mut result = new_lines.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "--- a/src/config.rs\n+++ b/src/config.rs\n@@ -1,3 +1,3 @@\n fn main() {\n-    let retries = 1;\n+    let retries = 3;\n }\n";

    #[test]
    fn extracts_fenced_diff_blocks_in_order() {
        let transcript = format!(
            "Here is the fix:\n\n```diff\n{SAMPLE_DIFF}```\n\nand a note.\n\n```diff\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-x\n+y\n```\n"
        );
        let blocks = extract_diff_blocks(&transcript);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("src/config.rs"));
        assert!(blocks[1].contains("b.txt"));
    }

    #[test]
    fn non_diff_fences_are_ignored() {
        let transcript = "```diff\njust prose, no headers\n```\n";
        assert!(extract_diff_blocks(transcript).is_empty());
    }

    #[test]
    fn parses_and_applies_a_simple_diff() {
        let diffs = parse_unified_diff(SAMPLE_DIFF).expect("parse");
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].target_path(), "src/config.rs");

        let original = "fn main() {\n    let retries = 1;\n}\n";
        let patched = apply_file_diff(original, &diffs[0]).expect("apply");
        assert_eq!(patched, "fn main() {\n    let retries = 3;\n}\n");
    }

    #[test]
    fn context_mismatch_rejects_the_diff() {
        let diffs = parse_unified_diff(SAMPLE_DIFF).expect("parse");
        let err = apply_file_diff("completely different file\n", &diffs[0]).expect_err("reject");
        assert!(err.contains("mismatch"));
    }

    #[test]
    fn new_file_diffs_collect_added_lines() {
        let diff_text = "--- /dev/null\n+++ b/notes.txt\n@@ -0,0 +1,2 @@\n+first\n+second\n";
        let diffs = parse_unified_diff(diff_text).expect("parse");
        assert!(diffs[0].creates_file());
        assert_eq!(diffs[0].target_path(), "notes.txt");
        let content = apply_file_diff("", &diffs[0]).expect("apply");
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn apply_is_idempotent_over_rollback() {
        let diffs = parse_unified_diff(SAMPLE_DIFF).expect("parse");
        let original = "fn main() {\n    let retries = 1;\n}\n";
        let once = apply_file_diff(original, &diffs[0]).expect("apply");
        // Rolling back to the original and re-applying yields the same bytes.
        let again = apply_file_diff(original, &diffs[0]).expect("re-apply");
        assert_eq!(once, again);
    }
}
