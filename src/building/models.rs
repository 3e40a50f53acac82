//! Building model entities as seen by the sync core
//!
//! Coordinates are in metres; fields suffixed `_mm` are millimetres, matching
//! what the element serializers emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session-scoped numeric handle assigned by the local CAD engine.
///
/// Not stable across sessions: the same Level can carry a different handle in
/// every editing session. Natural keys are used for cross-session identity.
pub type ElementHandle = i64;

// ============================================================================
// Entity kinds
// ============================================================================

/// The closed set of entity kinds mirrored into the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Building,
    Level,
    Room,
    Wall,
    Door,
    Stair,
    Pipe,
    ProvisionalSpace,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Building,
        EntityKind::Level,
        EntityKind::Room,
        EntityKind::Wall,
        EntityKind::Door,
        EntityKind::Stair,
        EntityKind::Pipe,
        EntityKind::ProvisionalSpace,
    ];

    /// Kinds whose `elementId` identifies a node of this session.
    ///
    /// Building and Level are shared across sessions and their handle is
    /// rewritten by whichever session touched them last, so a handle-only
    /// delete must never reach them.
    pub const HANDLE_KEYED: [EntityKind; 6] = [
        EntityKind::Room,
        EntityKind::Wall,
        EntityKind::Door,
        EntityKind::Stair,
        EntityKind::Pipe,
        EntityKind::ProvisionalSpace,
    ];

    /// Graph label of the node
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Building => "Building",
            EntityKind::Level => "Level",
            EntityKind::Room => "Room",
            EntityKind::Wall => "Wall",
            EntityKind::Door => "Door",
            EntityKind::Stair => "Stair",
            EntityKind::Pipe => "Pipe",
            EntityKind::ProvisionalSpace => "ProvisionalSpace",
        }
    }

    /// Property holding the natural key for nodes of this kind
    pub fn natural_key_property(&self) -> &'static str {
        match self {
            EntityKind::Building | EntityKind::Level => "name",
            _ => "uid",
        }
    }

    /// Whether the kind takes part in bounding-box derived relationships
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            EntityKind::Wall | EntityKind::Pipe | EntityKind::ProvisionalSpace
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity kind '{}'", s))
    }
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3,
    pub max: Point3,
}

impl BoundingBox {
    /// Build a box from two arbitrary corners
    pub fn new(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Box around a segment, padded by `pad` on every axis
    pub fn around_segment(start: Point3, end: Point3, pad: f64) -> Self {
        Self::new(start, end).expanded(pad)
    }

    pub fn expanded(&self, pad: f64) -> Self {
        let pad = pad.abs();
        Self {
            min: Point3::new(self.min.x - pad, self.min.y - pad, self.min.z - pad),
            max: Point3::new(self.max.x + pad, self.max.y + pad, self.max.z + pad),
        }
    }

    /// Inclusive overlap test on all six bounds
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }
}

// ============================================================================
// Per-kind attributes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingAttrs {
    pub handle: ElementHandle,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelAttrs {
    pub handle: ElementHandle,
    pub name: String,
    pub elevation: f64,
    pub building_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub name: String,
    pub level_name: String,
    /// Walls whose boundary segments enclose the room
    pub bounding_wall_uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub name: String,
    pub type_name: String,
    pub family_name: String,
    pub level_name: String,
    pub start: Point3,
    pub end: Point3,
    pub height_mm: f64,
    pub thickness_mm: f64,
    pub base_offset_mm: f64,
    pub structural: bool,
    pub flipped: bool,
    pub location_line: i64,
    pub user: String,
    /// Creation time, when the serializer reports one
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub name: String,
    pub family_name: String,
    pub symbol_name: String,
    pub level_name: String,
    pub host_wall_uid: Option<String>,
    pub position: Point3,
    pub rotation: f64,
    pub width: f64,
    pub height: f64,
    pub thickness: f64,
    pub user: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StairAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub name: String,
    pub base_level_name: String,
    pub top_level_name: String,
    pub user: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub level_name: Option<String>,
    pub system_type_id: i64,
    pub start: Point3,
    pub end: Point3,
    pub diameter: f64,
    pub user: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionalSpaceAttrs {
    pub handle: ElementHandle,
    pub uid: String,
    pub name: String,
    pub host_wall_uid: Option<String>,
    pub level_name: String,
    pub position: Point3,
    pub width: f64,
    pub height: f64,
    pub thickness: f64,
    pub rotation: f64,
    pub ifc_type: String,
    pub bb_min: Point3,
    pub bb_max: Point3,
    pub user: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

// ============================================================================
// Entity
// ============================================================================

/// A typed domain entity, one variant per graph label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "attrs")]
pub enum Entity {
    Building(BuildingAttrs),
    Level(LevelAttrs),
    Room(RoomAttrs),
    Wall(WallAttrs),
    Door(DoorAttrs),
    Stair(StairAttrs),
    Pipe(PipeAttrs),
    ProvisionalSpace(ProvisionalSpaceAttrs),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Building(_) => EntityKind::Building,
            Entity::Level(_) => EntityKind::Level,
            Entity::Room(_) => EntityKind::Room,
            Entity::Wall(_) => EntityKind::Wall,
            Entity::Door(_) => EntityKind::Door,
            Entity::Stair(_) => EntityKind::Stair,
            Entity::Pipe(_) => EntityKind::Pipe,
            Entity::ProvisionalSpace(_) => EntityKind::ProvisionalSpace,
        }
    }

    pub fn handle(&self) -> ElementHandle {
        match self {
            Entity::Building(a) => a.handle,
            Entity::Level(a) => a.handle,
            Entity::Room(a) => a.handle,
            Entity::Wall(a) => a.handle,
            Entity::Door(a) => a.handle,
            Entity::Stair(a) => a.handle,
            Entity::Pipe(a) => a.handle,
            Entity::ProvisionalSpace(a) => a.handle,
        }
    }

    /// Value of the natural key property (see [`EntityKind::natural_key_property`])
    pub fn natural_key(&self) -> &str {
        match self {
            Entity::Building(a) => &a.name,
            Entity::Level(a) => &a.name,
            Entity::Room(a) => &a.uid,
            Entity::Wall(a) => &a.uid,
            Entity::Door(a) => &a.uid,
            Entity::Stair(a) => &a.uid,
            Entity::Pipe(a) => &a.uid,
            Entity::ProvisionalSpace(a) => &a.uid,
        }
    }

    /// Last modification time reported by the serializer, when it has one
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Wall(a) => Some(a.modified),
            Entity::Door(a) => Some(a.modified),
            Entity::Stair(a) => Some(a.modified),
            Entity::Pipe(a) => Some(a.modified),
            Entity::ProvisionalSpace(a) => Some(a.modified),
            Entity::Building(_) | Entity::Level(_) | Entity::Room(_) => None,
        }
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Wall(a) => a.created,
            Entity::Door(a) => a.created,
            Entity::Pipe(a) => a.created,
            Entity::ProvisionalSpace(a) => a.created,
            _ => None,
        }
    }

    /// Bounding box used for spatial relationships (spatial kinds only)
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self {
            Entity::Pipe(p) => Some(BoundingBox::around_segment(
                p.start,
                p.end,
                p.diameter / 2.0,
            )),
            Entity::Wall(w) => {
                // thickness pads the plan only; height runs up from the offset base
                let half = w.thickness_mm.abs() / 1000.0 / 2.0;
                let plan = BoundingBox::new(w.start, w.end);
                let bottom = plan.min.z + w.base_offset_mm / 1000.0;
                let top = bottom + w.height_mm.max(0.0) / 1000.0;
                Some(BoundingBox {
                    min: Point3::new(plan.min.x - half, plan.min.y - half, bottom),
                    max: Point3::new(plan.max.x + half, plan.max.y + half, top),
                })
            }
            Entity::ProvisionalSpace(p) => Some(BoundingBox::new(p.bb_min, p.bb_max)),
            _ => None,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind(),
            handle: self.handle(),
            natural_key: self.natural_key().to_string(),
        }
    }
}

/// Identity of an entity that the local session has seen
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub handle: ElementHandle,
    pub natural_key: String,
}
