//! Memory Store (spec Section 4.7): `memories.md` under the state
//! directory.
//!
//! A human-readable, append-only document grouped into kind sections,
//! intended to be git-tracked so humans can curate it (Section 3). Grounded
//! in the donor `loop-core/src/report.rs`'s write-then-append idiom, adapted
//! from a TSV row format to a markdown bulleted-line-per-entry format, with a
//! small structured parser so `load` can round-trip entries back out.

use crate::fileutil::{self, ReadLock, WriteLock};
use crate::types::{MemoryEntry, MemoryKind};
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("io error: {0}")]
    Io(#[from] crate::fileutil::FileUtilError),
}

pub type Result<T> = std::result::Result<T, MemoryStoreError>;

pub struct MemoryStore {
    path: PathBuf,
}

/// One entry per line: `- [ID] (tag1, tag2) TIMESTAMP: CONTENT`, grouped
/// under a `## kind` heading. Kept intentionally simple and line-oriented so
/// a human editing the file out-of-band (Section 3) can't easily corrupt it.
fn format_entry(entry: &MemoryEntry) -> String {
    let tags = if entry.tags.is_empty() {
        String::new()
    } else {
        format!(" ({})", entry.tags.join(", "))
    };
    format!(
        "- [{}]{} {}: {}\n",
        entry.id,
        tags,
        entry.timestamp.to_rfc3339(),
        entry.content
    )
}

fn parse_entry(kind: MemoryKind, line: &str) -> Option<MemoryEntry> {
    let line = line.strip_prefix("- ")?;
    let (id_part, rest) = line.split_once(']')?;
    let id = id_part.strip_prefix('[')?.to_string();
    let rest = rest.trim_start();

    let (tags, rest) = if let Some(tag_rest) = rest.strip_prefix('(') {
        let (tag_str, after) = tag_rest.split_once(')')?;
        (
            tag_str
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            after.trim_start(),
        )
    } else {
        (Vec::new(), rest)
    };

    let (ts_str, content) = rest.split_once(':')?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(ts_str.trim())
        .ok()?
        .with_timezone(&Utc);

    Some(MemoryEntry {
        id,
        kind,
        content: content.trim().to_string(),
        tags,
        timestamp,
    })
}

fn kind_heading(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Pattern => "## pattern",
        MemoryKind::Decision => "## decision",
        MemoryKind::Fix => "## fix",
    }
}

impl MemoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one entry, creating the file and the day-unique id if needed.
    /// `id` uniqueness is per calendar day (Section 3).
    pub fn append(&self, kind: MemoryKind, content: impl Into<String>, tags: Vec<String>) -> Result<MemoryEntry> {
        let _lock = WriteLock::acquire(&self.path)?;
        let existing = fileutil::read_to_string_if_exists(&self.path)?.unwrap_or_default();
        let today = Utc::now().format("%Y%m%d").to_string();
        let seq = existing
            .lines()
            .filter(|l| l.trim_start().starts_with(&format!("- [{today}-")))
            .count()
            + 1;
        let entry = MemoryEntry {
            id: format!("{today}-{seq:03}"),
            kind,
            content: content.into(),
            tags,
            timestamp: Utc::now(),
        };

        let heading = kind_heading(kind);
        let mut out = String::new();
        let mut wrote_heading = false;
        let mut found_section = false;
        for line in existing.lines() {
            out.push_str(line);
            out.push('\n');
            if line.trim_end() == heading {
                found_section = true;
                out.push_str(&format_entry(&entry));
                wrote_heading = true;
            }
        }
        if !wrote_heading {
            if !out.is_empty() && !out.ends_with("\n\n") {
                out.push('\n');
            }
            out.push_str(heading);
            out.push('\n');
            out.push_str(&format_entry(&entry));
        }
        let _ = found_section;

        fileutil::atomic_write(&self.path, out.as_bytes())?;
        Ok(entry)
    }

    /// Parse the document back into structured entries, in file order
    /// (oldest first within each kind section, sections in pattern/decision/
    /// fix order as written).
    pub fn load(&self) -> Result<Vec<MemoryEntry>> {
        let _lock = ReadLock::acquire(&self.path)?;
        let contents = fileutil::read_to_string_if_exists(&self.path)?.unwrap_or_default();
        let mut entries = Vec::new();
        let mut current_kind = None;
        for line in contents.lines() {
            if let Some(stripped) = line.strip_prefix("## ") {
                current_kind = MemoryKind::parse(stripped);
                continue;
            }
            if let Some(kind) = current_kind {
                if let Some(entry) = parse_entry(kind, line) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Serialize most-recent-first as a bulleted list, halted by an
    /// approximate token budget (Section 4.7): tokens approximated as
    /// word-count × 1.3.
    pub fn format_for_injection(&self, max_tokens: u32) -> Result<String> {
        let mut entries = self.load()?;
        entries.sort_by_key(|e| e.timestamp);
        entries.reverse();

        let mut out = String::new();
        let mut tokens_used = 0.0_f64;
        for entry in &entries {
            let line = format!("- ({}) {}\n", entry.kind.as_str(), entry.content);
            let words = line.split_whitespace().count() as f64;
            let line_tokens = words * 1.3;
            if tokens_used + line_tokens > f64::from(max_tokens) && !out.is_empty() {
                break;
            }
            out.push_str(&line);
            tokens_used += line_tokens;
        }
        Ok(out)
    }
}
