//! Markdown checklist parsing and single-line task rewrites.
//!
//! Task identity is positional: a task is addressed by its 1-based line
//! number in the whole file (header block included), so anchors must be
//! recomputed after every rewrite.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static TASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([ \t]*)[-*+] \[([ xX])\] (.*)$").expect("valid task pattern"));

static REVIEW_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^#{1,6}[ \t]+review\b").expect("valid heading pattern"));

/// One checklist item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// 1-based line number in the file.
    pub line: usize,
    /// Nesting depth (two columns of indentation per level).
    pub depth: usize,
    /// Whether the box is ticked.
    pub done: bool,
    /// Task text.
    pub text: String,
}

/// Parse all tasks, ignoring the first `skip_lines` lines and fenced code.
pub fn parse_tasks(content: &str, skip_lines: usize) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut in_fence = false;
    for (idx, raw) in content.lines().enumerate().skip(skip_lines) {
        let line = raw.trim_end_matches('\r');
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = TASK.captures(line) {
            tasks.push(Task {
                line: idx + 1,
                depth: indent_width(&caps[1]) / 2,
                done: &caps[2] != " ",
                text: caps[3].trim_end().to_owned(),
            });
        }
    }
    tasks
}

/// `(task_count, done_count)`.
pub fn counts(tasks: &[Task]) -> (usize, usize) {
    (tasks.len(), tasks.iter().filter(|t| t.done).count())
}

/// Rewrite the checkbox on `line`, leaving every other byte untouched.
///
/// Returns `None` when `line` is not a task (outside the header and code
/// fences).
pub fn set_task(content: &str, skip_lines: usize, line: usize, done: bool) -> Option<String> {
    if !parse_tasks(content, skip_lines).iter().any(|t| t.line == line) {
        return None;
    }

    let mut out = String::with_capacity(content.len());
    for (idx, raw) in content.split_inclusive('\n').enumerate() {
        if idx + 1 != line {
            out.push_str(raw);
            continue;
        }
        let body = raw.trim_end_matches('\n').trim_end_matches('\r');
        let caps = TASK.captures(body)?;
        let mark = caps.get(2)?;
        out.push_str(&raw[..mark.start()]);
        out.push(if done { 'x' } else { ' ' });
        out.push_str(&raw[mark.end()..]);
    }
    Some(out)
}

/// Whether the text contains a heading named "Review" at any level.
pub fn has_review_section(content: &str) -> bool {
    REVIEW_HEADING.is_match(content)
}

/// First `# ` heading, used as a title fallback.
pub fn first_heading(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
}

fn indent_width(indent: &str) -> usize {
    indent.chars().map(|c| if c == '\t' { 2 } else { 1 }).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "\
---
title: Demo
---
# Demo
- [ ] first
- [x] second
  - [X] nested
\t- [ ] tabbed
* [ ] star
```
- [ ] in code
```
not a task - [ ] here
";

    #[test]
    fn parses_tasks_with_lines_and_depth() {
        let tasks = parse_tasks(PLAN, 3);
        let summary: Vec<(usize, usize, bool)> =
            tasks.iter().map(|t| (t.line, t.depth, t.done)).collect();
        assert_eq!(
            summary,
            vec![(5, 0, false), (6, 0, true), (7, 1, true), (8, 1, false), (9, 0, false)]
        );
        assert_eq!(tasks[0].text, "first");
    }

    #[test]
    fn header_lines_are_skipped() {
        let content = "---\n- [ ] fake: yes\n---\n- [ ] real\n";
        let tasks = parse_tasks(content, 3);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].line, 4);
    }

    #[test]
    fn counts_done() {
        assert_eq!(counts(&parse_tasks(PLAN, 3)), (5, 2));
    }

    #[test]
    fn set_task_rewrites_only_that_line() {
        let out = set_task(PLAN, 3, 5, true).unwrap();
        assert!(out.contains("- [x] first\n"));
        assert_eq!(out.len(), PLAN.len());
        let changed: Vec<_> = PLAN
            .lines()
            .zip(out.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn set_task_can_untick() {
        let out = set_task(PLAN, 3, 7, false).unwrap();
        assert!(out.contains("  - [ ] nested\n"));
    }

    #[test]
    fn set_task_is_idempotent() {
        let once = set_task(PLAN, 3, 5, true).unwrap();
        let twice = set_task(&once, 3, 5, true).unwrap();
        assert_eq!(once, twice);
        assert_eq!(counts(&parse_tasks(&once, 3)), counts(&parse_tasks(&twice, 3)));
    }

    #[test]
    fn set_task_rejects_non_tasks() {
        assert!(set_task(PLAN, 3, 4, true).is_none());
        assert!(set_task(PLAN, 3, 11, true).is_none());
        assert!(set_task(PLAN, 3, 999, true).is_none());
    }

    #[test]
    fn set_task_preserves_crlf() {
        let content = "- [ ] a\r\n- [ ] b\r\n";
        let out = set_task(content, 0, 2, true).unwrap();
        assert_eq!(out, "- [ ] a\r\n- [x] b\r\n");
    }

    #[test]
    fn review_heading_detection() {
        assert!(has_review_section("# Job\n## Review\n- [ ] check"));
        assert!(has_review_section("### review notes"));
        assert!(!has_review_section("We will review later"));
        assert!(!has_review_section("## Reviewer list"));
    }

    #[test]
    fn first_heading_fallback() {
        assert_eq!(first_heading(PLAN).as_deref(), Some("Demo"));
        assert_eq!(first_heading("no heading"), None);
    }
}
