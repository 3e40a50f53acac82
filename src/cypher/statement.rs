//! Structured Cypher statements
//!
//! A [`Statement`] is an ordered list of [`Clause`]s. It renders to the text
//! sent over Bolt and is also what the in-memory test store interprets, so the
//! two never drift apart.

use super::escape::{format_datetime, format_float, quote};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    TextList(Vec<String>),
    /// Evaluated by the database at execution time (`datetime()`)
    ServerNow,
}

impl PropertyValue {
    pub fn to_cypher(&self) -> String {
        match self {
            PropertyValue::Null => "null".to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => format_float(*f),
            PropertyValue::Text(s) => quote(s),
            PropertyValue::DateTime(t) => format_datetime(t),
            PropertyValue::TextList(items) => format!(
                "[{}]",
                items.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ")
            ),
            PropertyValue::ServerNow => "datetime()".to_string(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<&String> for PropertyValue {
    fn from(v: &String) -> Self {
        PropertyValue::Text(v.clone())
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PropertyValue::Null)
    }
}

/// Relationship types of the building graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelType {
    Contains,
    Bounds,
    InstalledIn,
    HasProvSpace,
    ContainedIn,
    Intersects,
    ConnectsTo,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::Contains => "CONTAINS",
            RelType::Bounds => "BOUNDS",
            RelType::InstalledIn => "INSTALLED_IN",
            RelType::HasProvSpace => "HAS_PROV_SPACE",
            RelType::ContainedIn => "CONTAINED_IN",
            RelType::Intersects => "INTERSECTS",
            RelType::ConnectsTo => "CONNECTS_TO",
        }
    }
}

impl fmt::Display for RelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// `(:Label {key: value})`
#[derive(Debug, Clone, PartialEq)]
pub struct NodePattern {
    pub label: &'static str,
    pub key: &'static str,
    pub value: PropertyValue,
}

impl NodePattern {
    pub fn new(label: &'static str, key: &'static str, value: impl Into<PropertyValue>) -> Self {
        Self {
            label,
            key,
            value: value.into(),
        }
    }

    fn render(&self, var: &str) -> String {
        format!(
            "({}:{} {{{}: {}}})",
            var,
            self.label,
            self.key,
            self.value.to_cypher()
        )
    }
}

/// `var.property = value`
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub property: &'static str,
    pub value: PropertyValue,
}

impl Assignment {
    pub fn new(property: &'static str, value: impl Into<PropertyValue>) -> Self {
        Self {
            property,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// `MERGE (var:Label {key: value}) [ON CREATE SET …] [SET …]`
    MergeNode {
        var: String,
        node: NodePattern,
        on_create: Vec<Assignment>,
        set: Vec<Assignment>,
    },
    /// `MATCH (var:Label {key: value})`
    MatchNode { var: String, node: NodePattern },
    /// `MERGE (from)-[:REL]->(to)` between two bound variables
    MergeEdge {
        from: String,
        rel: RelType,
        to: String,
    },
    /// Delete every `rel` edge attached to `var` in `direction`
    DetachEdges {
        var: String,
        rel: RelType,
        direction: Direction,
    },
    /// `MATCH (a)-[r:REL]->(b) DELETE r`
    DeleteEdge {
        from: NodePattern,
        rel: RelType,
        to: NodePattern,
    },
    /// `MATCH (n:Label {key: value}) DETACH DELETE n`
    DetachDelete { node: NodePattern },
    /// Handle-only delete across several labels
    UnionDetachDelete {
        labels: Vec<&'static str>,
        key: &'static str,
        value: PropertyValue,
    },
}

impl Clause {
    /// Clauses that begin with a MATCH and therefore need a `WITH` after writes
    fn starts_with_read(&self) -> bool {
        matches!(
            self,
            Clause::MatchNode { .. }
                | Clause::DeleteEdge { .. }
                | Clause::DetachDelete { .. }
                | Clause::UnionDetachDelete { .. }
        )
    }

    fn writes(&self) -> bool {
        !matches!(self, Clause::MatchNode { .. })
    }

    fn binds(&self) -> Option<&str> {
        match self {
            Clause::MergeNode { var, .. } | Clause::MatchNode { var, .. } => Some(var),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Clause::MergeNode {
                var,
                node,
                on_create,
                set,
            } => {
                let mut out = format!("MERGE {}", node.render(var));
                if !on_create.is_empty() {
                    out.push_str(" ON CREATE SET ");
                    out.push_str(&render_assignments(var, on_create));
                }
                if !set.is_empty() {
                    out.push_str(" SET ");
                    out.push_str(&render_assignments(var, set));
                }
                out
            }
            Clause::MatchNode { var, node } => format!("MATCH {}", node.render(var)),
            Clause::MergeEdge { from, rel, to } => {
                format!("MERGE ({})-[:{}]->({})", from, rel, to)
            }
            Clause::DetachEdges {
                var,
                rel,
                direction,
            } => {
                let pattern = match direction {
                    Direction::Outgoing => format!("({})-[r:{}]->()", var, rel),
                    Direction::Incoming => format!("({})<-[r:{}]-()", var, rel),
                };
                format!("FOREACH (old IN [{} | r] | DELETE old)", pattern)
            }
            Clause::DeleteEdge { from, rel, to } => format!(
                "MATCH {}-[r:{}]->{} DELETE r",
                from.render("a"),
                rel,
                to.render("b")
            ),
            Clause::DetachDelete { node } => {
                format!("MATCH {} DETACH DELETE n", node.render("n"))
            }
            Clause::UnionDetachDelete { labels, key, value } => {
                let label_test = labels
                    .iter()
                    .map(|l| format!("n:{}", l))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!(
                    "MATCH (n) WHERE n.{} = {} AND ({}) DETACH DELETE n",
                    key,
                    value.to_cypher(),
                    label_test
                )
            }
        }
    }
}

fn render_assignments(var: &str, assignments: &[Assignment]) -> String {
    assignments
        .iter()
        .map(|a| format!("{}.{} = {}", var, a.property, a.value.to_cypher()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One executable unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub clauses: Vec<Clause>,
}

impl Statement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, clause: Clause) -> &mut Self {
        self.clauses.push(clause);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Render to Cypher text.
    ///
    /// Cypher forbids a MATCH directly after an updating clause, so a
    /// `WITH` carrying every variable bound so far is inserted there.
    pub fn to_cypher(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.clauses.len());
        let mut bound: Vec<&str> = Vec::new();
        let mut pending_write = false;

        for clause in &self.clauses {
            if pending_write && clause.starts_with_read() {
                if !bound.is_empty() {
                    parts.push(format!("WITH {}", bound.join(", ")));
                } else {
                    parts.push("WITH count(*) AS _".to_string());
                }
                pending_write = false;
            }
            parts.push(clause.render());
            if clause.writes() {
                pending_write = true;
            }
            if let Some(var) = clause.binds() {
                if !bound.contains(&var) {
                    bound.push(var);
                }
            }
        }

        parts.join(" ")
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cypher())
    }
}
