//! Conversion between backend records and canonical [`Entity`] values.

use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    document::{fields, Document},
    entity::{Entity, Revision},
    error::{DaoError, DaoResult},
    timestamp,
};

/// Pure, side-effect free record translation.
pub trait Mapper: Send + Sync {
    fn to_domain(&self, doc: &Document) -> DaoResult<Entity>;
    fn to_db(&self, entity: &Entity) -> Document;
}

fn required_str<'a>(doc: &'a Document, key: &str) -> DaoResult<&'a str> {
    doc.get_str(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DaoError::mapping(format!("record is missing required field '{}'", key)))
}

fn date_field(doc: &Document, key: &str) -> DaoResult<Option<OffsetDateTime>> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.is_empty() => Ok(None),
        Some(Value::String(text)) => timestamp::parse(text)
            .map(Some)
            .map_err(|e| DaoError::mapping(format!("field '{}' is not an RFC 3339 date: {}", key, e))),
        Some(other) => Err(DaoError::mapping(format!(
            "field '{}' must be a date string, got {}",
            key, other
        ))),
    }
}

fn required_date(doc: &Document, key: &str) -> DaoResult<OffsetDateTime> {
    date_field(doc, key)?
        .ok_or_else(|| DaoError::mapping(format!("record is missing required field '{}'", key)))
}

/// Envelope shared by both document mappers.
fn document_envelope(doc: &Document) -> DaoResult<Entity> {
    let id = required_str(doc, fields::ID)?;
    let created_at = required_date(doc, fields::CREATED_DATE)?;
    let mut entity = Entity::new(id, doc.entity_type().unwrap_or_default(), created_at);
    entity.revision = doc.rev().map(|rev| Revision::Token(rev.to_string()));
    entity.updated_at = date_field(doc, fields::UPDATED_DATE)?;
    Ok(entity)
}

fn write_document_envelope(entity: &Entity) -> Document {
    let mut doc = Document::new().with(fields::ID, entity.id.as_str());
    if let Some(rev) = &entity.revision {
        doc.insert(fields::REV, rev.to_value());
    }
    if !entity.entity_type.is_empty() {
        doc.insert(fields::ENTITY_TYPE, entity.entity_type.as_str());
    }
    doc.insert(fields::CREATED_DATE, timestamp::format(entity.created_at));
    if let Some(updated) = entity.updated_at {
        doc.insert(fields::UPDATED_DATE, timestamp::format(updated));
    }
    doc
}

/// Maps only the document envelope (`_id`, `_rev`, `entityType`,
/// `createdDate`, `updatedDate`); everything else is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentMapper;

impl Mapper for DocumentMapper {
    fn to_domain(&self, doc: &Document) -> DaoResult<Entity> {
        document_envelope(doc)
    }

    fn to_db(&self, entity: &Entity) -> Document {
        write_document_envelope(entity)
    }
}

/// Like [`DocumentMapper`], but every unrecognised field passes through in
/// both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandingDocumentMapper;

const DOCUMENT_ENVELOPE: [&str; 5] = [
    fields::ID,
    fields::REV,
    fields::ENTITY_TYPE,
    fields::CREATED_DATE,
    fields::UPDATED_DATE,
];

impl Mapper for ExpandingDocumentMapper {
    fn to_domain(&self, doc: &Document) -> DaoResult<Entity> {
        let mut entity = document_envelope(doc)?;
        entity.fields = doc
            .iter()
            .filter(|(key, _)| !DOCUMENT_ENVELOPE.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(entity)
    }

    fn to_db(&self, entity: &Entity) -> Document {
        let mut doc = write_document_envelope(entity);
        for (key, value) in &entity.fields {
            if !doc.contains_key(key) {
                doc.insert(key.clone(), value.clone());
            }
        }
        doc
    }
}

/// Maps relational rows. Rows carry no `entityType` column; the mapper
/// fills it in from its configured type.
#[derive(Debug, Clone, Default)]
pub struct RelationalMapper {
    entity_type: String,
}

const RELATIONAL_ENVELOPE: [&str; 5] = [
    fields::ID,
    fields::VERSION,
    fields::ENTITY_TYPE,
    fields::CREATED_DATE,
    fields::UPDATED_DATE,
];

impl RelationalMapper {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }
}

impl Mapper for RelationalMapper {
    fn to_domain(&self, doc: &Document) -> DaoResult<Entity> {
        let id = required_str(doc, fields::ID)?;
        let created_at = required_date(doc, fields::CREATED_DATE)?;
        let mut entity = Entity::new(id, self.entity_type.as_str(), created_at);
        entity.revision = doc.version().map(Revision::Version);
        entity.updated_at = date_field(doc, fields::UPDATED_DATE)?;
        entity.fields = doc
            .iter()
            .filter(|(key, _)| !RELATIONAL_ENVELOPE.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(entity)
    }

    fn to_db(&self, entity: &Entity) -> Document {
        let mut doc = Document::new().with(fields::ID, entity.id.as_str());
        if let Some(version) = entity.revision.as_ref().and_then(Revision::as_version) {
            doc.insert(fields::VERSION, version);
        }
        doc.insert(fields::CREATED_DATE, timestamp::format(entity.created_at));
        if let Some(updated) = entity.updated_at {
            doc.insert(fields::UPDATED_DATE, timestamp::format(updated));
        }
        for (key, value) in &entity.fields {
            if !doc.contains_key(key) {
                doc.insert(key.clone(), value.clone());
            }
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[test]
    fn minimal_mapper_drops_domain_fields() {
        let stored = doc(json!({
            "_id": "Widget|1",
            "_rev": "2-aa",
            "entityType": "Widget|",
            "createdDate": "2024-05-01T10:00:00.000Z",
            "name": "sprocket"
        }));
        let entity = DocumentMapper.to_domain(&stored).unwrap();
        assert_eq!(entity.id, "Widget|1");
        assert_eq!(entity.revision, Some(Revision::Token("2-aa".into())));
        assert!(entity.fields.is_empty());
        assert!(DocumentMapper.to_db(&entity).get("name").is_none());
    }

    #[test]
    fn missing_id_or_created_date_is_a_mapping_error() {
        let no_id = doc(json!({"createdDate": "2024-05-01T10:00:00.000Z"}));
        let no_date = doc(json!({"_id": "Widget|1"}));
        let bad_date = doc(json!({"_id": "Widget|1", "createdDate": "last tuesday"}));
        for broken in [no_id, no_date, bad_date] {
            let err = DocumentMapper.to_domain(&broken).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Mapping);
        }
    }

    #[test]
    fn expanding_mapper_round_trips_every_field() {
        let stored = doc(json!({
            "_id": "Widget|1",
            "_rev": "3-bb",
            "entityType": "Widget|",
            "appVersion": "1.0.0",
            "createdDate": "2024-05-01T10:00:00.000Z",
            "updatedDate": "2024-05-02T08:30:00.125Z",
            "name": "sprocket",
            "tags": ["a", "b"],
            "dims": {"w": 2, "h": 3}
        }));
        let mapper = ExpandingDocumentMapper;
        let entity = mapper.to_domain(&stored).unwrap();
        assert_eq!(entity.field("appVersion"), Some(&json!("1.0.0")));
        assert_eq!(mapper.to_db(&entity), stored);
    }

    #[test]
    fn relational_mapper_fills_entity_type_and_version() {
        let row = doc(json!({
            "_id": "6f1c",
            "version": 4,
            "appVersion": "1.0.0",
            "createdDate": "2024-05-01T10:00:00.000Z",
            "name": "sprocket"
        }));
        let mapper = RelationalMapper::new("Widget|");
        let entity = mapper.to_domain(&row).unwrap();
        assert_eq!(entity.entity_type, "Widget|");
        assert_eq!(entity.revision, Some(Revision::Version(4)));
        assert_eq!(mapper.to_db(&entity), row);
    }
}
