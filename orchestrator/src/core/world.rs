//! World-model domain records and the pure operations over them.
//!
//! A [`WorldDocument`] is the full materialized world for one run. Storage
//! lives in `io::world_store`; this module only defines the records, how a
//! [`WorldChange`] mutates them, and the deterministic evidence ranking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TERM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+").expect("term regex should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Blocking,
}

/// A decision lock prevents new conclusions on an issue until superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLock {
    pub lock_id: String,
    pub issue_key: String,
    pub reason: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewTask {
    pub task_id: String,
    pub issue_key: String,
    pub title: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contradiction {
    pub contradiction_id: String,
    #[serde(default)]
    pub issue_key: Option<String>,
    pub summary: String,
    pub severity: Severity,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl Contradiction {
    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Canonical fact; authoritative over evidence and memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorFact {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// A citable fragment of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSegment {
    pub segment_id: String,
    pub content: String,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub row_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryNote {
    pub memory_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Note,
    Summary,
}

/// Memory item as read back from the store, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    pub source: MemorySource,
    pub text: String,
}

/// Anchor facts plus the keys that must be present for the anchor to be complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorSet {
    pub required: Vec<String>,
    pub facts: Vec<AnchorFact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSegment {
    pub segment: EvidenceSegment,
    pub score: f64,
}

/// Materialized world for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldDocument {
    pub locks: Vec<DecisionLock>,
    pub tasks: Vec<ReviewTask>,
    pub contradictions: Vec<Contradiction>,
    pub anchor_required: BTreeSet<String>,
    pub anchor_facts: BTreeMap<String, AnchorFact>,
    pub evidence: Vec<EvidenceSegment>,
    pub memory: Vec<MemoryNote>,
}

/// A single mutation applied by tools or by the `world apply` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum WorldChange {
    OpenLock {
        lock_id: String,
        issue_key: String,
        reason: String,
    },
    ReleaseLock {
        lock_id: String,
    },
    RaiseContradiction {
        contradiction_id: String,
        #[serde(default)]
        issue_key: Option<String>,
        summary: String,
        severity: Severity,
    },
    ResolveContradiction {
        contradiction_id: String,
        resolution: String,
    },
    RequireAnchor {
        key: String,
    },
    SetAnchorFact {
        key: String,
        value: String,
        #[serde(default)]
        source: Option<String>,
    },
    AddEvidence {
        segment_id: String,
        content: String,
        #[serde(default)]
        source_file: Option<String>,
        #[serde(default)]
        page_number: Option<u32>,
        #[serde(default)]
        row_number: Option<u32>,
    },
    AddMemory {
        memory_id: String,
        text: String,
    },
    OpenTask {
        task_id: String,
        issue_key: String,
        title: String,
    },
    ResolveTask {
        task_id: String,
    },
}

impl WorldDocument {
    pub fn active_locks(&self) -> impl Iterator<Item = &DecisionLock> {
        self.locks.iter().filter(|lock| lock.active)
    }

    pub fn open_tasks(&self) -> impl Iterator<Item = &ReviewTask> {
        self.tasks.iter().filter(|task| !task.resolved)
    }

    pub fn open_contradictions(&self) -> impl Iterator<Item = &Contradiction> {
        self.contradictions.iter().filter(|c| c.is_open())
    }

    pub fn anchor_set(&self) -> AnchorSet {
        AnchorSet {
            required: self.anchor_required.iter().cloned().collect(),
            facts: self.anchor_facts.values().cloned().collect(),
        }
    }

    /// Apply one change. Re-opening or re-adding an existing id overwrites it.
    pub fn apply(&mut self, change: &WorldChange) -> Result<(), String> {
        match change {
            WorldChange::OpenLock {
                lock_id,
                issue_key,
                reason,
            } => {
                let lock = DecisionLock {
                    lock_id: lock_id.clone(),
                    issue_key: issue_key.clone(),
                    reason: reason.clone(),
                    active: true,
                };
                upsert(&mut self.locks, lock, |l| &l.lock_id);
            }
            WorldChange::ReleaseLock { lock_id } => {
                let lock = self
                    .locks
                    .iter_mut()
                    .find(|l| &l.lock_id == lock_id)
                    .ok_or_else(|| format!("unknown lock {lock_id}"))?;
                lock.active = false;
            }
            WorldChange::RaiseContradiction {
                contradiction_id,
                issue_key,
                summary,
                severity,
            } => {
                let contradiction = Contradiction {
                    contradiction_id: contradiction_id.clone(),
                    issue_key: issue_key.clone(),
                    summary: summary.clone(),
                    severity: *severity,
                    resolution: None,
                };
                upsert(&mut self.contradictions, contradiction, |c| {
                    &c.contradiction_id
                });
            }
            WorldChange::ResolveContradiction {
                contradiction_id,
                resolution,
            } => {
                let contradiction = self
                    .contradictions
                    .iter_mut()
                    .find(|c| &c.contradiction_id == contradiction_id)
                    .ok_or_else(|| format!("unknown contradiction {contradiction_id}"))?;
                contradiction.resolution = Some(resolution.clone());
            }
            WorldChange::RequireAnchor { key } => {
                self.anchor_required.insert(key.clone());
            }
            WorldChange::SetAnchorFact { key, value, source } => {
                self.anchor_facts.insert(
                    key.clone(),
                    AnchorFact {
                        key: key.clone(),
                        value: value.clone(),
                        source: source.clone(),
                    },
                );
            }
            WorldChange::AddEvidence {
                segment_id,
                content,
                source_file,
                page_number,
                row_number,
            } => {
                let segment = EvidenceSegment {
                    segment_id: segment_id.clone(),
                    content: content.clone(),
                    source_file: source_file.clone(),
                    page_number: *page_number,
                    row_number: *row_number,
                };
                upsert(&mut self.evidence, segment, |s| &s.segment_id);
            }
            WorldChange::AddMemory { memory_id, text } => {
                let note = MemoryNote {
                    memory_id: memory_id.clone(),
                    text: text.clone(),
                };
                upsert(&mut self.memory, note, |m| &m.memory_id);
            }
            WorldChange::OpenTask {
                task_id,
                issue_key,
                title,
            } => {
                let task = ReviewTask {
                    task_id: task_id.clone(),
                    issue_key: issue_key.clone(),
                    title: title.clone(),
                    resolved: false,
                };
                upsert(&mut self.tasks, task, |t| &t.task_id);
            }
            WorldChange::ResolveTask { task_id } => {
                let task = self
                    .tasks
                    .iter_mut()
                    .find(|t| &t.task_id == task_id)
                    .ok_or_else(|| format!("unknown task {task_id}"))?;
                task.resolved = true;
            }
        }
        Ok(())
    }

    /// Rank evidence by the share of distinct query terms each segment contains.
    ///
    /// Segments with no matching term are excluded. Ties break on segment id so
    /// the ranking is stable across runs.
    pub fn search_evidence(&self, query: &str, limit: usize) -> Vec<ScoredSegment> {
        let terms = terms(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut scored: Vec<ScoredSegment> = self
            .evidence
            .iter()
            .filter_map(|segment| {
                let haystack = terms_of_segment(segment);
                let hits = terms.iter().filter(|t| haystack.contains(*t)).count();
                (hits > 0).then(|| ScoredSegment {
                    segment: segment.clone(),
                    score: hits as f64 / terms.len() as f64,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.segment.segment_id.cmp(&b.segment.segment_id))
        });
        scored.truncate(limit);
        scored
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|existing| id(existing) == id(&item)) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    TERM_RE
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .filter(|t| t.len() > 1)
        .collect()
}

fn terms_of_segment(segment: &EvidenceSegment) -> BTreeSet<String> {
    let mut all = terms(&segment.content);
    if let Some(file) = &segment.source_file {
        all.extend(terms(file));
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(id: &str, content: &str) -> WorldChange {
        WorldChange::AddEvidence {
            segment_id: id.to_string(),
            content: content.to_string(),
            source_file: None,
            page_number: None,
            row_number: None,
        }
    }

    #[test]
    fn locks_open_and_release() {
        let mut doc = WorldDocument::default();
        doc.apply(&WorldChange::OpenLock {
            lock_id: "L1".into(),
            issue_key: "ISSUE-1".into(),
            reason: "settled".into(),
        })
        .expect("open");
        assert_eq!(doc.active_locks().count(), 1);

        doc.apply(&WorldChange::ReleaseLock {
            lock_id: "L1".into(),
        })
        .expect("release");
        assert_eq!(doc.active_locks().count(), 0);
        assert_eq!(doc.locks.len(), 1);
    }

    #[test]
    fn resolving_unknown_records_is_an_error() {
        let mut doc = WorldDocument::default();
        let err = doc
            .apply(&WorldChange::ResolveTask {
                task_id: "missing".into(),
            })
            .expect_err("unknown task");
        assert!(err.contains("missing"));
        assert!(
            doc.apply(&WorldChange::ReleaseLock {
                lock_id: "nope".into()
            })
            .is_err()
        );
    }

    #[test]
    fn anchor_set_lists_required_keys_and_facts_in_key_order() {
        let mut doc = WorldDocument::default();
        for key in ["b", "a"] {
            doc.apply(&WorldChange::RequireAnchor { key: key.into() })
                .expect("require");
            doc.apply(&WorldChange::SetAnchorFact {
                key: key.into(),
                value: format!("{key}-value"),
                source: None,
            })
            .expect("set");
        }
        let anchor = doc.anchor_set();
        assert_eq!(anchor.required, vec!["a", "b"]);
        let keys: Vec<&str> = anchor.facts.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn evidence_search_ranks_by_term_coverage_then_id() {
        let mut doc = WorldDocument::default();
        doc.apply(&evidence("seg-b", "Total wages for 2024 were 1200"))
            .expect("add");
        doc.apply(&evidence("seg-a", "wages only")).expect("add");
        doc.apply(&evidence("seg-c", "unrelated text")).expect("add");
        doc.apply(&evidence("seg-d", "2024 wages recorded"))
            .expect("add");

        let ranked = doc.search_evidence("What were total wages in 2024?", 10);
        let ids: Vec<&str> = ranked
            .iter()
            .map(|s| s.segment.segment_id.as_str())
            .collect();
        assert_eq!(ids, vec!["seg-b", "seg-d", "seg-a"]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn evidence_search_honors_limit_and_empty_queries() {
        let mut doc = WorldDocument::default();
        doc.apply(&evidence("s1", "alpha beta")).expect("add");
        doc.apply(&evidence("s2", "alpha")).expect("add");
        assert_eq!(doc.search_evidence("alpha", 1).len(), 1);
        assert!(doc.search_evidence("??", 10).is_empty());
        assert!(doc.search_evidence("alpha", 0).is_empty());
    }

    #[test]
    fn world_change_uses_snake_case_tags() {
        let change: WorldChange = serde_json::from_str(
            r#"{"change":"raise_contradiction","contradiction_id":"C1","summary":"x","severity":"blocking"}"#,
        )
        .expect("parse");
        assert_eq!(
            change,
            WorldChange::RaiseContradiction {
                contradiction_id: "C1".into(),
                issue_key: None,
                summary: "x".into(),
                severity: Severity::Blocking,
            }
        );
    }
}
