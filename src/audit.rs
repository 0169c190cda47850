//! Size-bounded log of reconciliation passes.
//!
//! Each entry is an unindented header line followed by tab-indented detail
//! lines.  Before an entry is appended, lines are dropped from the head
//! until the new entry fits under the ceiling and the head no longer starts
//! with a continuation line.  An entry longer than the ceiling is cut to
//! its first `ceiling` lines, so the header always survives.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;

pub struct AuditLog {
    path: PathBuf,
    ceiling: usize,
    lock: Mutex<()>,
}

fn is_continuation(line: &str) -> bool {
    line.starts_with(char::is_whitespace)
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, ceiling: usize) -> Self {
        Self {
            path: path.into(),
            ceiling,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Echoes `entry` to stdout, then persists it.
    pub async fn append(&self, entry: &[String]) -> std::io::Result<()> {
        for line in entry {
            println!("{line}");
        }

        let entry = &entry[..entry.len().min(self.ceiling)];
        let _guard = self.lock.lock().await;
        let existing = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let mut lines: VecDeque<&str> = existing.lines().collect();
        while let Some(head) = lines.front() {
            if lines.len() + entry.len() > self.ceiling || is_continuation(head) {
                lines.pop_front();
            } else {
                break;
            }
        }

        let mut out = String::new();
        for line in lines.iter().copied().chain(entry.iter().map(String::as_str)) {
            out.push_str(line);
            out.push('\n');
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, out).await
    }
}
