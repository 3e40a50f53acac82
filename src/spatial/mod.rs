//! Derived spatial relationships
//!
//! CONTAINED_IN (Pipe→ProvisionalSpace) and INTERSECTS (Pipe→Wall) are derived
//! from bounding boxes and recomputed after every geometry change, on both
//! sides of the pair. [`SpatialIndex`] keeps the session-local view of
//! participant boxes and of the derived edges already written.

use crate::building::{BoundingBox, EntityKind};
use crate::cypher::RelType;
use std::collections::{HashMap, HashSet};

/// Identity of a spatial participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpatialKey {
    pub kind: EntityKind,
    pub uid: String,
}

impl SpatialKey {
    pub fn new(kind: EntityKind, uid: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAction {
    Add,
    Remove,
}

/// A derived edge to create or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeChange {
    pub rel: RelType,
    pub from: SpatialKey,
    pub to: SpatialKey,
    pub action: EdgeAction,
}

/// A potential partner of the subject, with its current edge state
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: SpatialKey,
    pub bbox: BoundingBox,
    pub has_edge: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialDiff {
    pub add: Vec<SpatialKey>,
    pub remove: Vec<SpatialKey>,
}

impl SpatialDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Stateless overlap diffing
pub struct SpatialUpdater;

impl SpatialUpdater {
    /// Edges to add (overlap, no edge yet) and remove (edge, no longer overlapping)
    pub fn recompute(subject: &BoundingBox, candidates: &[Candidate]) -> SpatialDiff {
        let mut diff = SpatialDiff::default();
        for c in candidates {
            let overlaps = subject.intersects(&c.bbox);
            if overlaps && !c.has_edge {
                diff.add.push(c.key.clone());
            } else if !overlaps && c.has_edge {
                diff.remove.push(c.key.clone());
            }
        }
        diff
    }
}

/// (partner kind, relationship, subject is the edge source)
fn rules(kind: EntityKind) -> &'static [(EntityKind, RelType, bool)] {
    match kind {
        EntityKind::Pipe => &[
            (EntityKind::ProvisionalSpace, RelType::ContainedIn, true),
            (EntityKind::Wall, RelType::Intersects, true),
        ],
        EntityKind::ProvisionalSpace => &[(EntityKind::Pipe, RelType::ContainedIn, false)],
        EntityKind::Wall => &[(EntityKind::Pipe, RelType::Intersects, false)],
        _ => &[],
    }
}

type EdgeKey = (RelType, SpatialKey, SpatialKey);

/// Session-local mirror of spatial participants and derived edges
#[derive(Debug, Default)]
pub struct SpatialIndex {
    boxes: HashMap<SpatialKey, BoundingBox>,
    edges: HashSet<EdgeKey>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the subject's new box and return the edge changes it implies
    pub fn update(&mut self, kind: EntityKind, uid: &str, bbox: BoundingBox) -> Vec<EdgeChange> {
        if !kind.is_spatial() {
            return Vec::new();
        }
        let subject = SpatialKey::new(kind, uid);
        self.boxes.insert(subject.clone(), bbox);

        let mut changes = Vec::new();
        for &(partner_kind, rel, subject_is_from) in rules(kind) {
            let orient = |partner: &SpatialKey| -> (SpatialKey, SpatialKey) {
                if subject_is_from {
                    (subject.clone(), partner.clone())
                } else {
                    (partner.clone(), subject.clone())
                }
            };

            let mut candidates: Vec<Candidate> = self
                .boxes
                .iter()
                .filter(|(k, _)| k.kind == partner_kind)
                .map(|(k, b)| {
                    let (from, to) = orient(k);
                    Candidate {
                        key: k.clone(),
                        bbox: *b,
                        has_edge: self.edges.contains(&(rel, from, to)),
                    }
                })
                .collect();
            candidates.sort_by(|a, b| a.key.cmp(&b.key));

            let diff = SpatialUpdater::recompute(&bbox, &candidates);
            for (partners, action) in [(diff.add, EdgeAction::Add), (diff.remove, EdgeAction::Remove)] {
                for partner in partners {
                    let (from, to) = orient(&partner);
                    let key = (rel, from.clone(), to.clone());
                    match action {
                        EdgeAction::Add => self.edges.insert(key),
                        EdgeAction::Remove => self.edges.remove(&key),
                    };
                    changes.push(EdgeChange {
                        rel,
                        from,
                        to,
                        action,
                    });
                }
            }
        }
        changes
    }

    /// Drop a participant and every derived edge touching it
    pub fn remove(&mut self, kind: EntityKind, uid: &str) {
        let key = SpatialKey::new(kind, uid);
        self.boxes.remove(&key);
        self.edges.retain(|(_, from, to)| *from != key && *to != key);
    }

    pub fn has_edge(&self, rel: RelType, from: &SpatialKey, to: &SpatialKey) -> bool {
        self.edges.contains(&(rel, from.clone(), to.clone()))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
