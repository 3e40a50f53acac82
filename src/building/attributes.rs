//! Decoding of serialized attribute maps into typed entities
//!
//! The local CAD layer flattens each element into a `SerializedElement`
//! (kind, handle, attribute map). This module turns that map into an
//! [`Entity`], reporting missing or mistyped attributes as [`AttributeError`].

use super::models::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A single attribute value as emitted by an element serializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    TextList(Vec<String>),
}

impl AttributeValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::Timestamp(_) => "timestamp",
            AttributeValue::Text(_) => "text",
            AttributeValue::TextList(_) => "text list",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttributeValue::Timestamp(v)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        AttributeValue::TextList(v)
    }
}

/// Flattened element as produced by an [`ElementSerializer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedElement {
    pub kind: EntityKind,
    pub handle: ElementHandle,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SerializedElement {
    pub fn new(kind: EntityKind, handle: ElementHandle) -> Self {
        Self {
            kind,
            handle,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion
    pub fn with(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Flattens a CAD-side element into attributes. Implemented by the host
/// application; the sync core only consumes its output.
pub trait ElementSerializer: Send + Sync {
    type Element;

    fn serialize(&self, element: &Self::Element) -> Result<SerializedElement, AttributeError>;
}

/// Errors raised while decoding a serialized element
#[derive(Debug, Error, PartialEq)]
pub enum AttributeError {
    #[error("{kind} {handle}: missing attribute '{key}'")]
    Missing {
        kind: EntityKind,
        handle: ElementHandle,
        key: String,
    },

    #[error("{kind} {handle}: attribute '{key}' expected {expected}, got {found}")]
    InvalidType {
        kind: EntityKind,
        handle: ElementHandle,
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{kind} {handle}: attribute '{key}' is not a valid timestamp: {value}")]
    InvalidTimestamp {
        kind: EntityKind,
        handle: ElementHandle,
        key: String,
        value: String,
    },

    #[error("{kind} {handle}: attribute '{key}' must not be empty")]
    Empty {
        kind: EntityKind,
        handle: ElementHandle,
        key: String,
    },
}

struct Reader<'a> {
    el: &'a SerializedElement,
}

impl<'a> Reader<'a> {
    fn value(&self, key: &str) -> Option<&'a AttributeValue> {
        match self.el.attributes.get(key) {
            None | Some(AttributeValue::Null) => None,
            Some(v) => Some(v),
        }
    }

    fn missing(&self, key: &str) -> AttributeError {
        AttributeError::Missing {
            kind: self.el.kind,
            handle: self.el.handle,
            key: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, expected: &'static str, found: &AttributeValue) -> AttributeError {
        AttributeError::InvalidType {
            kind: self.el.kind,
            handle: self.el.handle,
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    fn opt_text(&self, key: &str) -> Result<Option<String>, AttributeError> {
        match self.value(key) {
            None => Ok(None),
            Some(AttributeValue::Text(s)) if s.is_empty() => Ok(None),
            Some(AttributeValue::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(key, "text", other)),
        }
    }

    fn text(&self, key: &str) -> Result<String, AttributeError> {
        match self.value(key) {
            None => Err(self.missing(key)),
            Some(AttributeValue::Text(s)) => Ok(s.clone()),
            Some(other) => Err(self.invalid(key, "text", other)),
        }
    }

    /// Text that doubles as a natural key
    fn key(&self, key: &str) -> Result<String, AttributeError> {
        let value = self.text(key)?;
        if value.trim().is_empty() {
            return Err(AttributeError::Empty {
                kind: self.el.kind,
                handle: self.el.handle,
                key: key.to_string(),
            });
        }
        Ok(value)
    }

    fn text_or_default(&self, key: &str) -> Result<String, AttributeError> {
        Ok(self.opt_text(key)?.unwrap_or_default())
    }

    fn float(&self, key: &str) -> Result<f64, AttributeError> {
        match self.value(key) {
            None => Err(self.missing(key)),
            Some(AttributeValue::Float(v)) => Ok(*v),
            Some(AttributeValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(self.invalid(key, "float", other)),
        }
    }

    fn float_or(&self, key: &str, default: f64) -> Result<f64, AttributeError> {
        match self.value(key) {
            None => Ok(default),
            Some(_) => self.float(key),
        }
    }

    fn int_or(&self, key: &str, default: i64) -> Result<i64, AttributeError> {
        match self.value(key) {
            None => Ok(default),
            Some(AttributeValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.invalid(key, "int", other)),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, AttributeError> {
        match self.value(key) {
            None => Ok(default),
            Some(AttributeValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.invalid(key, "bool", other)),
        }
    }

    fn text_list(&self, key: &str) -> Result<Vec<String>, AttributeError> {
        match self.value(key) {
            None => Ok(Vec::new()),
            Some(AttributeValue::TextList(v)) => Ok(v.clone()),
            Some(other) => Err(self.invalid(key, "text list", other)),
        }
    }

    /// Timestamps arrive either typed or as ISO-8601 text; absent means now
    fn timestamp(&self, key: &str) -> Result<DateTime<Utc>, AttributeError> {
        Ok(self.opt_timestamp(key)?.unwrap_or_else(Utc::now))
    }

    fn opt_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, AttributeError> {
        match self.value(key) {
            None => Ok(None),
            Some(AttributeValue::Timestamp(t)) => Ok(Some(*t)),
            Some(AttributeValue::Text(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|_| AttributeError::InvalidTimestamp {
                    kind: self.el.kind,
                    handle: self.el.handle,
                    key: key.to_string(),
                    value: s.clone(),
                }),
            Some(other) => Err(self.invalid(key, "timestamp", other)),
        }
    }

    fn point(&self, x: &str, y: &str, z: &str) -> Result<Point3, AttributeError> {
        Ok(Point3::new(self.float(x)?, self.float(y)?, self.float(z)?))
    }
}

impl Entity {
    /// Decode a serialized element into a typed entity
    pub fn from_serialized(el: &SerializedElement) -> Result<Entity, AttributeError> {
        let r = Reader { el };
        let handle = el.handle;

        let entity = match el.kind {
            EntityKind::Building => Entity::Building(BuildingAttrs {
                handle,
                name: r.key("name")?,
            }),
            EntityKind::Level => Entity::Level(LevelAttrs {
                handle,
                name: r.key("name")?,
                elevation: r.float_or("elevation", 0.0)?,
                building_name: r.key("buildingName")?,
            }),
            EntityKind::Room => Entity::Room(RoomAttrs {
                handle,
                uid: r.key("uid")?,
                name: r.text_or_default("name")?,
                level_name: r.key("levelName")?,
                bounding_wall_uids: r.text_list("boundingWallUids")?,
            }),
            EntityKind::Wall => Entity::Wall(WallAttrs {
                handle,
                uid: r.key("uid")?,
                name: r.text_or_default("name")?,
                type_name: r.text_or_default("typeName")?,
                family_name: r.text_or_default("familyName")?,
                level_name: r.key("levelName")?,
                start: r.point("x1", "y1", "z1")?,
                end: r.point("x2", "y2", "z2")?,
                height_mm: r.float_or("heightMm", 0.0)?,
                thickness_mm: r.float_or("thicknessMm", 0.0)?,
                base_offset_mm: r.float_or("baseOffsetMm", 0.0)?,
                structural: r.bool_or("structural", false)?,
                flipped: r.bool_or("flipped", false)?,
                location_line: r.int_or("locationLine", 0)?,
                user: r.text_or_default("user")?,
                created: r.opt_timestamp("created")?,
                modified: r.timestamp("modified")?,
            }),
            EntityKind::Door => Entity::Door(DoorAttrs {
                handle,
                uid: r.key("uid")?,
                name: r.text_or_default("name")?,
                family_name: r.text_or_default("familyName")?,
                symbol_name: r.text_or_default("symbolName")?,
                level_name: r.key("levelName")?,
                host_wall_uid: r.opt_text("hostWallUid")?,
                position: r.point("x", "y", "z")?,
                rotation: r.float_or("rotation", 0.0)?,
                width: r.float_or("width", 0.0)?,
                height: r.float_or("height", 0.0)?,
                thickness: r.float_or("thickness", 0.0)?,
                user: r.text_or_default("user")?,
                created: r.opt_timestamp("created")?,
                modified: r.timestamp("modified")?,
            }),
            EntityKind::Stair => Entity::Stair(StairAttrs {
                handle,
                uid: r.key("uid")?,
                name: r.text_or_default("name")?,
                base_level_name: r.key("baseLevelName")?,
                top_level_name: r.key("topLevelName")?,
                user: r.text_or_default("user")?,
                modified: r.timestamp("modified")?,
            }),
            EntityKind::Pipe => Entity::Pipe(PipeAttrs {
                handle,
                uid: r.key("uid")?,
                level_name: r.opt_text("levelName")?,
                system_type_id: r.int_or("systemTypeId", -1)?,
                start: r.point("x1", "y1", "z1")?,
                end: r.point("x2", "y2", "z2")?,
                diameter: r.float_or("diameter", 0.0)?,
                user: r.text_or_default("user")?,
                created: r.opt_timestamp("created")?,
                modified: r.timestamp("modified")?,
            }),
            EntityKind::ProvisionalSpace => Entity::ProvisionalSpace(ProvisionalSpaceAttrs {
                handle,
                uid: r.key("uid")?,
                name: r.text_or_default("name")?,
                host_wall_uid: r.opt_text("hostWallUid")?,
                level_name: r.key("levelName")?,
                position: r.point("x", "y", "z")?,
                width: r.float_or("width", 0.0)?,
                height: r.float_or("height", 0.0)?,
                thickness: r.float_or("thickness", 0.0)?,
                rotation: r.float_or("rotation", 0.0)?,
                ifc_type: r.text_or_default("ifcType")?,
                bb_min: r.point("bbMinX", "bbMinY", "bbMinZ")?,
                bb_max: r.point("bbMaxX", "bbMaxY", "bbMaxZ")?,
                user: r.text_or_default("user")?,
                created: r.opt_timestamp("created")?,
                modified: r.timestamp("modified")?,
            }),
        };

        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> SerializedElement {
        SerializedElement::new(EntityKind::Pipe, 900)
            .with("uid", "pipe-900")
            .with("x1", 0.0)
            .with("y1", 0.0)
            .with("z1", 1.0)
            .with("x2", 5.0)
            .with("y2", 0.0)
            .with("z2", 1.0)
            .with("diameter", 0.1)
            .with("modified", "2024-05-01T10:00:00Z")
    }

    #[test]
    fn test_decode_pipe() {
        let entity = Entity::from_serialized(&pipe()).unwrap();
        match entity {
            Entity::Pipe(p) => {
                assert_eq!(p.uid, "pipe-900");
                assert_eq!(p.end.x, 5.0);
                assert_eq!(p.level_name, None);
                assert_eq!(p.system_type_id, -1);
                assert_eq!(p.modified.to_rfc3339(), "2024-05-01T10:00:00+00:00");
            }
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_int_accepted_for_float() {
        let el = pipe().with("diameter", 1i64);
        let Entity::Pipe(p) = Entity::from_serialized(&el).unwrap() else {
            panic!("expected pipe");
        };
        assert_eq!(p.diameter, 1.0);
    }

    #[test]
    fn test_missing_coordinate() {
        let mut el = pipe();
        el.attributes.remove("y2");
        let err = Entity::from_serialized(&el).unwrap_err();
        assert_eq!(
            err,
            AttributeError::Missing {
                kind: EntityKind::Pipe,
                handle: 900,
                key: "y2".into()
            }
        );
        assert!(err.to_string().contains("Pipe 900"));
    }

    #[test]
    fn test_wrong_type() {
        let el = pipe().with("diameter", "wide");
        let err = Entity::from_serialized(&el).unwrap_err();
        assert!(matches!(err, AttributeError::InvalidType { ref key, .. } if key == "diameter"));
    }

    #[test]
    fn test_bad_timestamp() {
        let el = pipe().with("modified", "yesterday");
        assert!(matches!(
            Entity::from_serialized(&el),
            Err(AttributeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_empty_natural_key_rejected() {
        let el = SerializedElement::new(EntityKind::Level, 3)
            .with("name", "  ")
            .with("buildingName", "HQ");
        assert!(matches!(
            Entity::from_serialized(&el),
            Err(AttributeError::Empty { .. })
        ));
    }

    #[test]
    fn test_empty_host_is_none() {
        let el = SerializedElement::new(EntityKind::Door, 12)
            .with("uid", "door-12")
            .with("levelName", "L1")
            .with("hostWallUid", "")
            .with("x", 1.0)
            .with("y", 2.0)
            .with("z", 0.0);
        let Entity::Door(d) = Entity::from_serialized(&el).unwrap() else {
            panic!("expected door");
        };
        assert_eq!(d.host_wall_uid, None);
    }

    #[test]
    fn test_room_bounding_walls() {
        let el = SerializedElement::new(EntityKind::Room, 40)
            .with("uid", "room-40")
            .with("levelName", "L1")
            .with(
                "boundingWallUids",
                vec!["w1".to_string(), "w2".to_string()],
            );
        let Entity::Room(r) = Entity::from_serialized(&el).unwrap() else {
            panic!("expected room");
        };
        assert_eq!(r.bounding_wall_uids, vec!["w1", "w2"]);
    }

    #[test]
    fn test_date_like_text_stays_text() {
        let el: SerializedElement = serde_json::from_value(serde_json::json!({
            "kind": "Wall",
            "handle": 501,
            "attributes": {
                "uid": "w-501",
                "name": "2024-05-01T10:00:00Z",
                "levelName": "L1",
                "x1": 0.0, "y1": 0.0, "z1": 0.0,
                "x2": 4.0, "y2": 0.0, "z2": 0.0,
                "modified": "2024-05-01T10:00:00Z"
            }
        }))
        .unwrap();
        assert_eq!(
            el.attributes.get("name"),
            Some(&AttributeValue::Text("2024-05-01T10:00:00Z".into()))
        );
        let Entity::Wall(w) = Entity::from_serialized(&el).unwrap() else {
            panic!("expected wall");
        };
        assert_eq!(w.name, "2024-05-01T10:00:00Z");
        assert_eq!(w.modified.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_absent_created_stays_unset() {
        let Entity::Pipe(p) = Entity::from_serialized(&pipe()).unwrap() else {
            panic!("expected pipe");
        };
        assert_eq!(p.created, None);

        let el = pipe().with("created", "2024-04-01T08:00:00Z");
        let Entity::Pipe(p) = Entity::from_serialized(&el).unwrap() else {
            panic!("expected pipe");
        };
        assert_eq!(
            p.created.map(|t| t.to_rfc3339()).as_deref(),
            Some("2024-04-01T08:00:00+00:00")
        );
    }
}
