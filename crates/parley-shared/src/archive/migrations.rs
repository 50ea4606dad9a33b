//! Attachment shape migrations for archive blobs.
//!
//! Archives written over the years carry attachments under different keys.
//! Each entry below recognises one key, runs independently of the others
//! (a message may carry several collections at once) and maps every item to
//! a canonical [`Attachment`]. A malformed item is a parse error; items are
//! never skipped. New shapes are added by appending to
//! [`ATTACHMENT_MIGRATIONS`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use serde_yaml::Mapping;

use crate::constants::LINK_PREVIEW_TYPE;
use crate::error::CommunicationError;
use crate::model::Attachment;
use crate::types::{AttachmentId, SocialId};

use super::flex_time;

/// Author and time used when a legacy item does not record its own.
pub struct MigrationContext<'a> {
    pub creator: &'a SocialId,
    pub created: DateTime<Utc>,
}

pub struct AttachmentMigration {
    /// Key holding the collection on a message.
    pub key: &'static str,
    /// Date this shape stopped being written; `None` for the current one.
    pub retired: Option<&'static str>,
    convert: fn(&serde_yaml::Value, &MigrationContext<'_>) -> Result<Attachment, String>,
}

pub const ATTACHMENT_MIGRATIONS: &[AttachmentMigration] = &[
    AttachmentMigration {
        key: "attachments",
        retired: None,
        convert: convert_canonical,
    },
    AttachmentMigration {
        key: "files",
        retired: Some("2024-05-20"),
        convert: convert_file,
    },
    AttachmentMigration {
        key: "blobs",
        retired: Some("2024-11-04"),
        convert: convert_blob,
    },
    AttachmentMigration {
        key: "linkPreviews",
        retired: Some("2025-02-17"),
        convert: convert_link_preview,
    },
];

/// Collect attachments from every known collection on a raw message.
pub fn migrate_attachments(
    raw: &Mapping,
    ctx: &MigrationContext<'_>,
) -> Result<Vec<Attachment>, CommunicationError> {
    let mut out = Vec::new();

    for migration in ATTACHMENT_MIGRATIONS {
        let Some(value) = raw.get(migration.key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let items = value.as_sequence().ok_or_else(|| {
            CommunicationError::Parse(format!("`{}` must be a list", migration.key))
        })?;

        for (index, item) in items.iter().enumerate() {
            let attachment = (migration.convert)(item, ctx).map_err(|e| {
                CommunicationError::Parse(format!("{}[{index}]: {e}", migration.key))
            })?;
            out.push(attachment);
        }

        if migration.retired.is_some() && !items.is_empty() {
            tracing::debug!(
                key = migration.key,
                count = items.len(),
                "migrated legacy attachments"
            );
        }
    }

    Ok(out)
}

fn params(entries: Vec<(&str, Option<Value>)>) -> Value {
    let map: Map<String, Value> = entries
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();
    Value::Object(map)
}

fn author(
    creator: Option<SocialId>,
    created: Option<DateTime<Utc>>,
    ctx: &MigrationContext<'_>,
) -> (SocialId, DateTime<Utc>) {
    (
        creator.unwrap_or_else(|| ctx.creator.clone()),
        created.unwrap_or(ctx.created),
    )
}

#[derive(Deserialize)]
struct CanonicalItem {
    id: AttachmentId,
    #[serde(rename = "type")]
    mime: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    creator: Option<SocialId>,
    #[serde(default, deserialize_with = "flex_time::option")]
    created: Option<DateTime<Utc>>,
}

fn convert_canonical(
    item: &serde_yaml::Value,
    ctx: &MigrationContext<'_>,
) -> Result<Attachment, String> {
    let raw: CanonicalItem = serde_yaml::from_value(item.clone()).map_err(|e| e.to_string())?;
    let (creator, created) = author(raw.creator, raw.created, ctx);
    Ok(Attachment {
        id: raw.id,
        mime: raw.mime,
        params: raw.params,
        creator,
        created,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyFile {
    blob_id: String,
    #[serde(rename = "type")]
    mime: String,
    filename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    meta: Option<Value>,
    #[serde(default)]
    creator: Option<SocialId>,
    #[serde(default, deserialize_with = "flex_time::option")]
    created: Option<DateTime<Utc>>,
}

fn convert_file(item: &serde_yaml::Value, ctx: &MigrationContext<'_>) -> Result<Attachment, String> {
    let raw: LegacyFile = serde_yaml::from_value(item.clone()).map_err(|e| e.to_string())?;
    let (creator, created) = author(raw.creator, raw.created, ctx);
    Ok(Attachment {
        id: AttachmentId::new(raw.blob_id.clone()),
        mime: raw.mime,
        params: params(vec![
            ("blobId", Some(json!(raw.blob_id))),
            ("fileName", Some(json!(raw.filename))),
            ("size", raw.size.map(|s| json!(s))),
            ("metadata", raw.meta),
        ]),
        creator,
        created,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBlob {
    blob_id: String,
    #[serde(alias = "contentType")]
    mime_type: String,
    file_name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    creator: Option<SocialId>,
    #[serde(default, deserialize_with = "flex_time::option")]
    created: Option<DateTime<Utc>>,
}

fn convert_blob(item: &serde_yaml::Value, ctx: &MigrationContext<'_>) -> Result<Attachment, String> {
    let raw: LegacyBlob = serde_yaml::from_value(item.clone()).map_err(|e| e.to_string())?;
    let (creator, created) = author(raw.creator, raw.created, ctx);
    Ok(Attachment {
        id: AttachmentId::new(raw.blob_id.clone()),
        mime: raw.mime_type,
        params: params(vec![
            ("blobId", Some(json!(raw.blob_id))),
            ("fileName", Some(json!(raw.file_name))),
            ("size", raw.size.map(|s| json!(s))),
            ("metadata", raw.metadata),
        ]),
        creator,
        created,
    })
}

/// Link previews were stored as opaque parameter bags.
fn convert_link_preview(
    item: &serde_yaml::Value,
    ctx: &MigrationContext<'_>,
) -> Result<Attachment, String> {
    let value: Value = serde_yaml::from_value(item.clone()).map_err(|e| e.to_string())?;
    let Value::Object(mut fields) = value else {
        return Err("link preview must be a mapping".to_string());
    };

    let creator = match fields.remove("creator") {
        Some(Value::String(s)) => Some(SocialId::new(s)),
        Some(other) => return Err(format!("creator must be a string, got {other}")),
        None => None,
    };
    let created = match fields.remove("created") {
        Some(v) => Some(flex_time::from_json(&v)?),
        None => None,
    };

    let id = ["previewId", "id", "url"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(Value::as_str))
        .map(AttachmentId::from)
        .ok_or_else(|| "link preview has neither previewId nor url".to_string())?;

    let (creator, created) = author(creator, created, ctx);
    Ok(Attachment {
        id,
        mime: LINK_PREVIEW_TYPE.to_string(),
        params: Value::Object(fields),
        creator,
        created,
    })
}
