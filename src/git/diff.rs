//! Parsing for git porcelain status, numstat and unified diffs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of change a file underwent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// A changed file from `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Previous path for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

/// One file in a diff summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub kind: ChangeKind,
    pub additions: u32,
    pub deletions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    /// Unified diff content for this file, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A parsed diff with per-file detail and totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub files: Vec<DiffFile>,
    pub additions: u32,
    pub deletions: u32,
}

/// Parse `git status --porcelain` output, including the rename form
/// `R  old -> new`.
pub fn parse_porcelain_status(output: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (codes, rest) = line.split_at(2);
        let rest = rest.trim_start();
        let x = codes.chars().next().unwrap_or(' ');
        let y = codes.chars().nth(1).unwrap_or(' ');

        if x == 'R' || y == 'R' {
            if let Some((old, new)) = rest.split_once(" -> ") {
                changes.push(FileChange {
                    path: new.to_string(),
                    kind: ChangeKind::Renamed,
                    old_path: Some(old.to_string()),
                });
            }
            continue;
        }

        let kind = if x == '?' || x == 'A' || y == 'A' {
            ChangeKind::Added
        } else if x == 'D' || y == 'D' {
            ChangeKind::Deleted
        } else {
            ChangeKind::Modified
        };
        changes.push(FileChange {
            path: rest.to_string(),
            kind,
            old_path: None,
        });
    }
    changes
}

/// Parse `git diff --name-status` output into path -> (kind, old_path).
fn parse_name_status(output: &str) -> HashMap<String, (ChangeKind, Option<String>)> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let Some(status) = fields.next() else { continue };
        match status.chars().next() {
            Some('A') => {
                if let Some(path) = fields.next() {
                    map.insert(path.to_string(), (ChangeKind::Added, None));
                }
            }
            Some('D') => {
                if let Some(path) = fields.next() {
                    map.insert(path.to_string(), (ChangeKind::Deleted, None));
                }
            }
            Some('R') | Some('C') => {
                if let (Some(old), Some(new)) = (fields.next(), fields.next()) {
                    map.insert(new.to_string(), (ChangeKind::Renamed, Some(old.to_string())));
                }
            }
            Some(_) => {
                if let Some(path) = fields.next() {
                    map.insert(path.to_string(), (ChangeKind::Modified, None));
                }
            }
            None => {}
        }
    }
    map
}

/// Resolve the numstat path column, which uses `old => new` (possibly inside
/// braces: `src/{old => new}/mod.rs`) for renames.
fn resolve_numstat_path(raw: &str) -> (String, Option<String>) {
    if let (Some(open), Some(close)) = (raw.find('{'), raw.find('}'))
        && open < close
        && raw[open..close].contains(" => ")
    {
        let prefix = &raw[..open];
        let suffix = &raw[close + 1..];
        let inner = &raw[open + 1..close];
        let (old_mid, new_mid) = inner.split_once(" => ").unwrap_or((inner, inner));
        let join = |mid: &str| {
            let mut p = format!("{prefix}{mid}{suffix}");
            // A vanished segment leaves a double slash behind.
            while p.contains("//") {
                p = p.replace("//", "/");
            }
            p
        };
        return (join(new_mid), Some(join(old_mid)));
    }
    if let Some((old, new)) = raw.split_once(" => ") {
        return (new.to_string(), Some(old.to_string()));
    }
    (raw.to_string(), None)
}

/// Parse `git diff --numstat` output, classifying each file. Zero-deletion
/// entries cannot be told apart from additions by numstat alone, so the
/// secondary `--name-status` output disambiguates.
pub fn parse_numstat(numstat: &str, name_status: &str) -> Diff {
    let kinds = parse_name_status(name_status);
    let mut diff = Diff::default();

    for line in numstat.lines() {
        let mut fields = line.split('\t');
        let (Some(adds), Some(dels)) = (fields.next(), fields.next()) else {
            continue;
        };
        let raw_path = fields.collect::<Vec<_>>().join("\t");
        if raw_path.is_empty() {
            continue;
        }
        // Binary files report "-" counts.
        let additions: u32 = adds.parse().unwrap_or(0);
        let deletions: u32 = dels.parse().unwrap_or(0);

        let (path, numstat_old) = resolve_numstat_path(&raw_path);
        let (kind, old_path) = match kinds.get(&path) {
            Some((kind, old)) => (*kind, old.clone()),
            None => {
                // Fall back to a heuristic when name-status is missing the
                // entry; zero-deletion entries default to modified.
                let kind = if numstat_old.is_some() {
                    ChangeKind::Renamed
                } else if additions > 0 && deletions == 0 {
                    ChangeKind::Modified
                } else if additions == 0 && deletions > 0 {
                    ChangeKind::Deleted
                } else {
                    ChangeKind::Modified
                };
                (kind, numstat_old)
            }
        };

        diff.additions += additions;
        diff.deletions += deletions;
        diff.files.push(DiffFile {
            path,
            kind,
            additions,
            deletions,
            old_path,
            content: None,
        });
    }
    diff
}

/// Split a unified diff into per-file content, keyed by the post-image path.
pub fn split_content_diff(unified: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current_path: Option<String> = None;
    let mut current = String::new();

    for line in unified.lines() {
        if let Some(header) = line.strip_prefix("diff --git ") {
            if let Some(path) = current_path.take() {
                sections.insert(path, std::mem::take(&mut current));
            }
            current_path = parse_diff_git_header(header);
        }
        if current_path.is_some() {
            current.push_str(line);
            current.push('\n');
        }
    }
    if let Some(path) = current_path {
        sections.insert(path, current);
    }
    sections
}

/// Extract the b-side path from a `diff --git a/x b/y` header remainder.
fn parse_diff_git_header(header: &str) -> Option<String> {
    let b_side = header.split(" b/").last()?;
    if b_side == header {
        return None;
    }
    Some(b_side.to_string())
}
