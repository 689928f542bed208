use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};

use idr_schemas::{MergeAuditEvent, SightingEvent};

use crate::chain::{canonical_json_line, compute_line_hash, AuditLine};
use crate::{AuditQuery, AuditRecord, AuditSink};

struct FileTarget {
    path: PathBuf,
    hash_chain: bool,
}

#[derive(Default)]
struct State {
    records: Vec<AuditRecord>,
    last_hash: Option<String>,
}

/// Append-only audit log, queryable in memory and optionally mirrored to a
/// JSON Lines file.
///
/// A row is kept in memory only after the file write succeeded, so the two
/// never diverge.
pub struct AuditLog {
    state: Mutex<State>,
    file: Option<FileTarget>,
    span: tracing::Span,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(State::default()),
            file: None,
            span: tracing::info_span!("audit_log"),
        }
    }

    /// Open (or create) a file-backed log. Existing rows are loaded so
    /// queries cover history and the hash chain resumes where it stopped.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        let mut state = State::default();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read audit log {:?}", path))?;
            for (i, raw) in content.lines().enumerate() {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let line: AuditLine = serde_json::from_str(trimmed)
                    .with_context(|| format!("parse audit line {} of {:?}", i + 1, path))?;
                state.last_hash = line.hash_self.clone();
                state.records.push(line.record);
            }
        }

        let span = tracing::info_span!("audit_log", path = %path.display());
        span.in_scope(|| {
            tracing::debug!(rows = state.records.len(), hash_chain, "audit log opened");
        });

        Ok(Self {
            state: Mutex::new(state),
            file: Some(FileTarget { path, hash_chain }),
            span,
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_hash(&self) -> Option<String> {
        self.lock().last_hash.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn append(&self, record: AuditRecord) -> Result<()> {
        let _enter = self.span.enter();
        let mut state = self.lock();

        if let Some(target) = &self.file {
            let mut line = AuditLine {
                seq: state.records.len() as u64,
                record: record.clone(),
                hash_prev: None,
                hash_self: None,
            };
            if target.hash_chain {
                line.hash_prev = state.last_hash.clone();
                line.hash_self = Some(compute_line_hash(&line)?);
            }
            let text = canonical_json_line(&line)?;
            append_line(&target.path, &text).inspect_err(|e| {
                tracing::error!(operation = "audit_append", error = %e, "audit write failed");
            })?;
            state.last_hash = line.hash_self;
        }

        tracing::debug!(
            actor = record.actor(),
            partition = record.partition(),
            "audit row appended"
        );
        state.records.push(record);
        Ok(())
    }
}

impl AuditSink for AuditLog {
    fn append_sighting_event(&self, event: SightingEvent) -> Result<()> {
        self.append(AuditRecord::Sighting(event))
    }

    fn append_merge_event(&self, event: MergeAuditEvent) -> Result<()> {
        self.append(AuditRecord::Merge(event))
    }

    fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.lock()
            .records
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(query.effective_limit())
            .cloned()
            .collect()
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}
