//! Entity → Cypher translation
//!
//! Every statement is keyed on the entity's natural key, so replaying it or
//! running it from another session converges on the same node. Parent and host
//! relationships are rebuilt inside the same statement.

use super::statement::{Assignment, Clause, Direction, NodePattern, PropertyValue, RelType, Statement};
use crate::building::{ElementHandle, Entity, EntityKind, EntityRef};
use crate::spatial::{EdgeAction, EdgeChange};

const SUBJECT: &str = "n";

/// Pure translator from domain entities to [`Statement`]s
#[derive(Debug, Clone)]
pub struct UpsertTranslator {
    session_id: String,
}

impl UpsertTranslator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Create-or-update statement for an entity
    pub fn upsert(&self, entity: &Entity) -> Statement {
        let mut st = Statement::new();
        let kind = entity.kind();
        let subject = NodePattern::new(
            kind.label(),
            kind.natural_key_property(),
            entity.natural_key(),
        );

        let mut set = vec![Assignment::new("elementId", entity.handle())];
        set.extend(attribute_assignments(entity));
        set.push(Assignment::new(
            "lastModifiedUtc",
            entity
                .modified()
                .map(PropertyValue::DateTime)
                .unwrap_or(PropertyValue::ServerNow),
        ));
        set.push(Assignment::new("lastSession", self.session_id.as_str()));

        st.push(Clause::MergeNode {
            var: SUBJECT.to_string(),
            node: subject,
            on_create: vec![
                Assignment::new("createdAt", PropertyValue::ServerNow),
                Assignment::new("createdBy", self.session_id.as_str()),
            ],
            set,
        });

        match entity {
            Entity::Building(_) | Entity::Pipe(_) => {}
            Entity::Level(l) => {
                contained_in(&mut st, "b", NodePattern::new("Building", "name", &l.building_name));
            }
            Entity::Room(r) => {
                contained_in(&mut st, "l", level_node(&r.level_name));
                detach(&mut st, RelType::Bounds, Direction::Incoming);
                for (i, wall_uid) in r.bounding_wall_uids.iter().enumerate() {
                    let var = format!("w{}", i);
                    merge_ref(&mut st, &var, NodePattern::new("Wall", "uid", wall_uid));
                    edge(&mut st, &var, RelType::Bounds, SUBJECT);
                }
            }
            Entity::Wall(w) => {
                contained_in(&mut st, "l", level_node(&w.level_name));
            }
            Entity::Door(d) => {
                contained_in(&mut st, "l", level_node(&d.level_name));
                detach(&mut st, RelType::InstalledIn, Direction::Outgoing);
                if let Some(host) = &d.host_wall_uid {
                    merge_ref(&mut st, "h", NodePattern::new("Wall", "uid", host));
                    edge(&mut st, SUBJECT, RelType::InstalledIn, "h");
                }
            }
            Entity::Stair(s) => {
                contained_in(&mut st, "lb", level_node(&s.base_level_name));
                detach(&mut st, RelType::ConnectsTo, Direction::Outgoing);
                detach(&mut st, RelType::ConnectsTo, Direction::Incoming);
                merge_ref(&mut st, "lt", level_node(&s.top_level_name));
                edge(&mut st, "lb", RelType::ConnectsTo, SUBJECT);
                edge(&mut st, SUBJECT, RelType::ConnectsTo, "lt");
            }
            Entity::ProvisionalSpace(p) => {
                detach(&mut st, RelType::HasProvSpace, Direction::Incoming);
                if let Some(host) = &p.host_wall_uid {
                    merge_ref(&mut st, "h", NodePattern::new("Wall", "uid", host));
                    edge(&mut st, "h", RelType::HasProvSpace, SUBJECT);
                }
            }
        }

        st
    }

    /// Delete statement for a handle.
    ///
    /// With a known identity the delete is exact. Without one it falls back to
    /// a handle match over every handle-keyed label, which may also hit a node
    /// of another session that happens to carry the same handle.
    pub fn remove(&self, handle: ElementHandle, known: Option<&EntityRef>) -> Statement {
        let mut st = Statement::new();
        match known {
            Some(r) => {
                st.push(Clause::DetachDelete {
                    node: NodePattern::new(
                        r.kind.label(),
                        r.kind.natural_key_property(),
                        r.natural_key.as_str(),
                    ),
                });
            }
            None => {
                st.push(Clause::UnionDetachDelete {
                    labels: EntityKind::HANDLE_KEYED.iter().map(|k| k.label()).collect(),
                    key: "elementId",
                    value: PropertyValue::Int(handle),
                });
            }
        }
        st
    }

    /// Statement applying one derived-relationship change
    pub fn relate(&self, change: &EdgeChange) -> Statement {
        let from = NodePattern::new(change.from.kind.label(), "uid", change.from.uid.as_str());
        let to = NodePattern::new(change.to.kind.label(), "uid", change.to.uid.as_str());
        let mut st = Statement::new();
        match change.action {
            EdgeAction::Add => {
                st.push(Clause::MatchNode {
                    var: "a".to_string(),
                    node: from,
                });
                st.push(Clause::MatchNode {
                    var: "b".to_string(),
                    node: to,
                });
                edge(&mut st, "a", change.rel, "b");
            }
            EdgeAction::Remove => {
                st.push(Clause::DeleteEdge {
                    from,
                    rel: change.rel,
                    to,
                });
            }
        }
        st
    }
}

fn level_node(name: &str) -> NodePattern {
    NodePattern::new("Level", "name", name)
}

fn merge_ref(st: &mut Statement, var: &str, node: NodePattern) {
    st.push(Clause::MergeNode {
        var: var.to_string(),
        node,
        on_create: vec![],
        set: vec![],
    });
}

fn edge(st: &mut Statement, from: &str, rel: RelType, to: &str) {
    st.push(Clause::MergeEdge {
        from: from.to_string(),
        rel,
        to: to.to_string(),
    });
}

fn detach(st: &mut Statement, rel: RelType, direction: Direction) {
    st.push(Clause::DetachEdges {
        var: SUBJECT.to_string(),
        rel,
        direction,
    });
}

/// Replace the subject's parent with `parent` (via CONTAINS)
fn contained_in(st: &mut Statement, var: &str, parent: NodePattern) {
    detach(st, RelType::Contains, Direction::Incoming);
    merge_ref(st, var, parent);
    edge(st, var, RelType::Contains, SUBJECT);
}

fn attribute_assignments(entity: &Entity) -> Vec<Assignment> {
    use Assignment as A;
    let mut set = match entity {
        Entity::Building(_) => vec![],
        Entity::Level(l) => vec![
            A::new("elevation", l.elevation),
            A::new("buildingName", &l.building_name),
        ],
        Entity::Room(r) => vec![
            A::new("name", &r.name),
            A::new("levelName", &r.level_name),
        ],
        Entity::Wall(w) => vec![
            A::new("name", &w.name),
            A::new("typeName", &w.type_name),
            A::new("familyName", &w.family_name),
            A::new("levelName", &w.level_name),
            A::new("x1", w.start.x),
            A::new("y1", w.start.y),
            A::new("z1", w.start.z),
            A::new("x2", w.end.x),
            A::new("y2", w.end.y),
            A::new("z2", w.end.z),
            A::new("heightMm", w.height_mm),
            A::new("thicknessMm", w.thickness_mm),
            A::new("baseOffsetMm", w.base_offset_mm),
            A::new("structural", w.structural),
            A::new("flipped", w.flipped),
            A::new("locationLine", w.location_line),
            A::new("user", &w.user),
            A::new("modified", w.modified),
        ],
        Entity::Door(d) => vec![
            A::new("name", &d.name),
            A::new("familyName", &d.family_name),
            A::new("symbolName", &d.symbol_name),
            A::new("levelName", &d.level_name),
            A::new("hostWallUid", d.host_wall_uid.as_ref()),
            A::new("x", d.position.x),
            A::new("y", d.position.y),
            A::new("z", d.position.z),
            A::new("rotation", d.rotation),
            A::new("width", d.width),
            A::new("height", d.height),
            A::new("thickness", d.thickness),
            A::new("user", &d.user),
            A::new("modified", d.modified),
        ],
        Entity::Stair(s) => vec![
            A::new("name", &s.name),
            A::new("baseLevelName", &s.base_level_name),
            A::new("topLevelName", &s.top_level_name),
            A::new("user", &s.user),
            A::new("modified", s.modified),
        ],
        Entity::Pipe(p) => vec![
            A::new("levelName", p.level_name.as_ref()),
            A::new("systemTypeId", p.system_type_id),
            A::new("x1", p.start.x),
            A::new("y1", p.start.y),
            A::new("z1", p.start.z),
            A::new("x2", p.end.x),
            A::new("y2", p.end.y),
            A::new("z2", p.end.z),
            A::new("diameter", p.diameter),
            A::new("user", &p.user),
            A::new("modified", p.modified),
        ],
        Entity::ProvisionalSpace(p) => vec![
            A::new("name", &p.name),
            A::new("hostWallUid", p.host_wall_uid.as_ref()),
            A::new("levelName", &p.level_name),
            A::new("x", p.position.x),
            A::new("y", p.position.y),
            A::new("z", p.position.z),
            A::new("width", p.width),
            A::new("height", p.height),
            A::new("thickness", p.thickness),
            A::new("rotation", p.rotation),
            A::new("ifcType", &p.ifc_type),
            A::new("bbMinX", p.bb_min.x),
            A::new("bbMinY", p.bb_min.y),
            A::new("bbMinZ", p.bb_min.z),
            A::new("bbMaxX", p.bb_max.x),
            A::new("bbMaxY", p.bb_max.y),
            A::new("bbMaxZ", p.bb_max.z),
            A::new("user", &p.user),
            A::new("modified", p.modified),
        ],
    };
    // absent creation time leaves any stored value alone
    if let Some(created) = entity.created() {
        set.push(A::new("created", created));
    }
    set
}
