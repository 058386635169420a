// SPDX-License-Identifier: PMPL-1.0-or-later

//! Loading fact stores from disk
//!
//! Two layouts are understood:
//!
//! - a single JSON document `{"entities": [...], "relations": [...]}`
//! - a database directory holding `entities.json` and one relation
//!   document per file anywhere below `relations/`
//!
//! Row values are plain JSON scalars decoded against the column type, so
//! an entity column holds bare integers.

use crate::store::{FactStore, FactStoreBuilder};
use crate::types::{Column, ColumnType, EntityId, EntityInfo, Location, Schema, Tuple, Value};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    entities: Vec<EntityDoc>,
    #[serde(default)]
    relations: Vec<RelationDoc>,
}

#[derive(Debug, Deserialize)]
struct EntityDoc {
    id: u64,
    kind: String,
    label: String,
    #[serde(default)]
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct RelationDoc {
    name: String,
    columns: Vec<Column>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

/// Load a store from a JSON document or a database directory
pub fn load(path: &Path) -> Result<FactStore> {
    let store = if path.is_dir() {
        load_directory(path)?
    } else {
        load_document(path)?
    };
    info!(
        path = %path.display(),
        relations = store.relation_names().len(),
        facts = store.len(),
        entities = store.entity_count(),
        "fact store loaded"
    );
    Ok(store)
}

pub fn load_document(path: &Path) -> Result<FactStore> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading fact store {}", path.display()))?;
    from_json(&data).with_context(|| format!("loading fact store {}", path.display()))
}

pub fn from_json(data: &str) -> Result<FactStore> {
    let doc: StoreDoc = serde_json::from_str(data).context("parsing fact store document")?;
    let mut builder = FactStore::builder();
    for entity in doc.entities {
        add_entity(&mut builder, entity);
    }
    for relation in doc.relations {
        add_relation(&mut builder, relation)?;
    }
    Ok(builder.build())
}

pub fn load_directory(dir: &Path) -> Result<FactStore> {
    let mut builder = FactStore::builder();

    let entities_path = dir.join("entities.json");
    if entities_path.is_file() {
        let data = fs::read_to_string(&entities_path)
            .with_context(|| format!("reading {}", entities_path.display()))?;
        let entities: Vec<EntityDoc> = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", entities_path.display()))?;
        for entity in entities {
            add_entity(&mut builder, entity);
        }
    }

    let relations_dir = dir.join("relations");
    if !relations_dir.is_dir() {
        bail!("{} has no relations/ directory", dir.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&relations_dir).follow_links(true) {
        let entry = entry.with_context(|| format!("walking {}", relations_dir.display()))?;
        files.push(entry.into_path());
    }
    files.retain(|path| {
        path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false)
    });
    files.sort();

    for file in files {
        debug!(file = %file.display(), "loading relation file");
        let data = fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        let relation: RelationDoc = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", file.display()))?;
        add_relation(&mut builder, relation)
            .with_context(|| format!("loading {}", file.display()))?;
    }

    Ok(builder.build())
}

fn add_entity(builder: &mut FactStoreBuilder, doc: EntityDoc) {
    builder.add_entity(
        EntityId(doc.id),
        EntityInfo {
            kind: doc.kind,
            label: doc.label,
            location: doc.location,
        },
    );
}

fn add_relation(builder: &mut FactStoreBuilder, doc: RelationDoc) -> Result<()> {
    let schema = Schema::new(doc.columns);
    let mut rows: Vec<Tuple> = Vec::with_capacity(doc.rows.len());
    for (line, raw) in doc.rows.iter().enumerate() {
        if raw.len() != schema.arity() {
            bail!(
                "row {} of `{}` has {} value(s), schema has {}",
                line,
                doc.name,
                raw.len(),
                schema.arity()
            );
        }
        let row = raw
            .iter()
            .zip(&schema.columns)
            .map(|(value, column)| decode_value(value, column.ty))
            .collect::<Result<Tuple>>()
            .with_context(|| format!("row {} of `{}`", line, doc.name))?;
        rows.push(row);
    }
    builder
        .add_relation(&doc.name, schema, rows)
        .map_err(|err| anyhow!(err))?;
    Ok(())
}

fn decode_value(raw: &serde_json::Value, ty: ColumnType) -> Result<Value> {
    let value = match ty {
        ColumnType::Entity => raw.as_u64().map(Value::entity),
        ColumnType::String => raw.as_str().map(Value::string),
        ColumnType::Int => raw.as_i64().map(Value::Int),
        ColumnType::Bool => raw.as_bool().map(Value::Bool),
    };
    value.ok_or_else(|| anyhow!("expected {} value, found {}", ty, raw))
}
