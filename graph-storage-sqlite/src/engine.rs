//! SQLite-backed `GraphStore` implementation (spec §4.1, §6).
//!
//! Grounded on the teacher's `storage/sqlite/src/engine.rs`
//! (`SqliteStorageEngine`/`SqliteBucket` over a `bb8::Pool<
//! SqliteConnectionManager>`, table creation on first use, `with_connection`
//! spawn_blocking closures). The schema is the two-table `nodes` /
//! `node_properties` design from spec §6 rather than the teacher's
//! per-collection state/event tables, since this crate has a single
//! uniform node/property shape instead of per-entity-type collections.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use graph_core::error::{GraphError, StoreError, ValidationError};
use graph_core::event::{EventBus, MutationEvent};
use graph_core::ids::{well_known, NodeId, SystemId};
use graph_core::model::{AssembledNode, FieldEntry, GraphNode, PropertyRow, SupertagRef};
use graph_core::store::{CreateNodeOptions, GraphStore};
use graph_core::value::Value;
use rusqlite::{Connection, OptionalExtension};

use crate::connection::SqliteConnectionManager;
use crate::error::SqliteError;

pub const DEFAULT_POOL_SIZE: u32 = 10;
const MAX_INHERITANCE_DEPTH: u32 = 10;

pub struct SqliteGraphStore {
    pool: bb8::Pool<SqliteConnectionManager>,
    bus: Arc<EventBus>,
}

impl SqliteGraphStore {
    pub fn new(pool: bb8::Pool<SqliteConnectionManager>, bus: Arc<EventBus>) -> Self { Self { pool, bus } }

    pub async fn open(path: impl AsRef<std::path::Path>, bus: Arc<EventBus>) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = bb8::Pool::builder().max_size(DEFAULT_POOL_SIZE).build(manager).await?;
        let store = Self::new(pool, bus);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory(bus: Arc<EventBus>) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        // A single connection keeps the in-memory database alive for the
        // pool's lifetime (teacher's `open_in_memory` convention).
        let pool = bb8::Pool::builder().max_size(1).build(manager).await?;
        let store = Self::new(pool, bus);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &bb8::Pool<SqliteConnectionManager> { &self.pool }

    async fn ensure_schema(&self) -> Result<(), SqliteError> {
        let conn = self.pool.get().await.map_err(|e| SqliteError::Pool(e.to_string()))?;
        conn.with_connection(|c| {
            c.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    id            TEXT PRIMARY KEY,
                    content       TEXT,
                    content_plain TEXT,
                    system_id     TEXT UNIQUE,
                    owner_id      TEXT,
                    created_at    INTEGER NOT NULL,
                    updated_at    INTEGER NOT NULL,
                    deleted_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_nodes_owner_id ON nodes(owner_id);
                CREATE INDEX IF NOT EXISTS idx_nodes_content_plain ON nodes(content_plain);

                CREATE TABLE IF NOT EXISTS node_properties (
                    id            INTEGER PRIMARY KEY AUTOINCREMENT,
                    node_id       TEXT NOT NULL,
                    field_node_id TEXT NOT NULL,
                    value         TEXT NOT NULL,
                    "order"       INTEGER NOT NULL DEFAULT 0,
                    created_at    INTEGER NOT NULL,
                    updated_at    INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_props_node_id ON node_properties(node_id);
                CREATE INDEX IF NOT EXISTS idx_props_field_node_id ON node_properties(field_node_id);
                CREATE INDEX IF NOT EXISTS idx_props_value ON node_properties(value);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_props_identity ON node_properties(node_id, field_node_id, "order");
                "#,
            )
            .map_err(SqliteError::from)
        })
        .await
    }

    async fn conn(&self) -> Result<crate::connection::PooledConnection, StoreError> {
        self.pool.get().await.map_err(|e| SqliteError::Pool(e.to_string()).into())
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 { ts.timestamp_millis() }

fn from_millis(ms: i64) -> DateTime<Utc> { Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now) }

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<GraphNode> {
    let id_str: String = row.get("id")?;
    let id = NodeId::from_str(&id_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(std::io::Error::other(e.to_string()))))?;
    let owner_id: Option<String> = row.get("owner_id")?;
    let owner_id = owner_id.and_then(|s| NodeId::from_str(&s).ok());
    Ok(GraphNode {
        id,
        content: row.get("content")?,
        content_plain: row.get("content_plain")?,
        system_id: row.get("system_id")?,
        owner_id,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(from_millis),
    })
}

fn require_live(node: &GraphNode) -> Result<(), ValidationError> {
    if node.is_live() {
        Ok(())
    } else {
        Err(ValidationError::NodeDeleted(node.id))
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StoreError> {
        let conn = self.conn().await?;
        let id_str = id.to_string();
        conn.with_connection(move |c| {
            c.query_row("SELECT * FROM nodes WHERE id = ?1", [&id_str], row_to_node).optional().map_err(SqliteError::from)
        })
        .await
        .map_err(Into::into)
    }

    async fn get_node_by_system_id(&self, system_id: &str, include_deleted: bool) -> Result<Option<GraphNode>, StoreError> {
        let conn = self.conn().await?;
        let system_id = system_id.to_string();
        conn.with_connection(move |c| {
            let node = c.query_row("SELECT * FROM nodes WHERE system_id = ?1", [&system_id], row_to_node).optional()?;
            Ok(node.filter(|n| include_deleted || n.is_live()))
        })
        .await
        .map_err(Into::into)
    }

    async fn list_live_node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        let conn = self.conn().await?;
        conn.with_connection(|c| {
            let mut stmt = c.prepare("SELECT id FROM nodes WHERE deleted_at IS NULL")?;
            let ids: Vec<String> = stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect();
            Ok(ids.into_iter().filter_map(|s| NodeId::from_str(&s).ok()).collect())
        })
        .await
        .map_err(Into::into)
    }

    async fn properties_of(&self, node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError> {
        let conn = self.conn().await?;
        let id_str = node_id.to_string();
        conn.with_connection(move |c| {
            let mut stmt = c.prepare(
                r#"SELECT id, node_id, field_node_id, value, "order", created_at, updated_at
                   FROM node_properties WHERE node_id = ?1"#,
            )?;
            let rows = stmt.query_map([&id_str], |r| property_row_from(r, node_id))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(Into::into)
    }

    async fn properties_by_field(&self, field_node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError> {
        let conn = self.conn().await?;
        let field_str = field_node_id.to_string();
        conn.with_connection(move |c| {
            let mut stmt = c.prepare(
                r#"SELECT id, node_id, field_node_id, value, "order", created_at, updated_at
                   FROM node_properties WHERE field_node_id = ?1"#,
            )?;
            let rows = stmt.query_map([&field_str], |r| {
                let node_id_str: String = r.get("node_id")?;
                let node_id = NodeId::from_str(&node_id_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(std::io::Error::other(e.to_string())))
                })?;
                property_row_from(r, node_id)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(Into::into)
    }

    async fn assemble(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError> {
        let Some(node) = self.get_node(id).await? else { return Ok(None) };
        if !node.is_live() {
            return Ok(None);
        }
        let mut assembled = AssembledNode::new(&node);

        let conn = self.conn().await?;
        let id_str = id.to_string();
        let entries: Vec<(Option<String>, FieldEntry)> = conn
            .with_connection(move |c| {
                let mut stmt = c.prepare(
                    r#"SELECT np.value AS value, np."order" AS "order", np.field_node_id AS field_node_id,
                              fn.system_id AS field_system_id, fn.content AS field_content
                       FROM node_properties np
                       JOIN nodes fn ON fn.id = np.field_node_id
                       WHERE np.node_id = ?1
                       ORDER BY np.field_node_id, np."order""#,
                )?;
                let rows = stmt.query_map([&id_str], |r| {
                    let raw_value: String = r.get("value")?;
                    let order: i64 = r.get("order")?;
                    let field_node_id_str: String = r.get("field_node_id")?;
                    let field_system_id: Option<String> = r.get("field_system_id")?;
                    let field_content: Option<String> = r.get("field_content")?;
                    Ok((raw_value, order, field_node_id_str, field_system_id, field_content))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (raw_value, order, field_node_id_str, field_system_id, field_content) = row?;
                    let Some(field_system_id) = field_system_id else { continue };
                    let Ok(field_node_id) = NodeId::from_str(&field_node_id_str) else { continue };
                    let value = Value::from_json_str(&raw_value).unwrap_or(Value::Null);
                    out.push((field_content, FieldEntry { value, raw_value, field_node_id, field_system_id, order }));
                }
                Ok(out)
            })
            .await?;

        for (name, entry) in entries {
            assembled.push_field(name.as_deref(), entry);
        }

        if let Some(supertag_entries) = assembled.fields_by_system_id.get(well_known::FIELD_SUPERTAG).cloned() {
            for entry in supertag_entries {
                if let Value::String(sid) = &entry.value {
                    if let Some(stag_node) = self.get_node_by_system_id(sid, true).await? {
                        assembled.supertags.push(SupertagRef { id: stag_node.id, system_id: sid.clone(), content: stag_node.content });
                    }
                }
            }
        }
        Ok(Some(assembled))
    }

    async fn assemble_inherited(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError> {
        let Some(mut result) = self.assemble(id).await? else { return Ok(None) };

        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut queue: std::collections::VecDeque<(String, u32)> = result.supertags.iter().map(|s| (s.system_id.clone(), 1)).collect();
        for (sid, _) in &queue {
            visited.insert(sid.clone());
        }

        while let Some((sid, depth)) = queue.pop_front() {
            if depth > MAX_INHERITANCE_DEPTH {
                continue;
            }
            if let Some(stag_node) = self.get_node_by_system_id(&sid, true).await? {
                if let Some(stag_assembled) = self.assemble(stag_node.id).await? {
                    for (key, entries) in &stag_assembled.fields_by_system_id {
                        if key == well_known::FIELD_SUPERTAG || key == well_known::FIELD_EXTENDS {
                            continue;
                        }
                        result.fields_by_system_id.entry(key.clone()).or_insert_with(|| entries.clone());
                    }
                    for (key, entries) in &stag_assembled.fields_by_name {
                        result.fields_by_name.entry(key.clone()).or_insert_with(|| entries.clone());
                    }
                }
            }
            if let Some(parent) = self.supertag_parent(&sid).await? {
                if visited.insert(parent.clone()) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        Ok(Some(result))
    }

    async fn supertag_parent(&self, supertag_system_id: &str) -> Result<Option<String>, StoreError> {
        let Some(stag_node) = self.get_node_by_system_id(supertag_system_id, true).await? else { return Ok(None) };
        let Some(assembled) = self.assemble(stag_node.id).await? else { return Ok(None) };
        Ok(match assembled.value(well_known::FIELD_EXTENDS) {
            Some(Value::String(parent)) => Some(parent),
            _ => None,
        })
    }

    async fn supertag_descendants(&self, supertag_system_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn().await?;
        let candidates: Vec<String> = conn
            .with_connection(|c| {
                let mut stmt = c.prepare("SELECT system_id FROM nodes WHERE deleted_at IS NULL AND system_id LIKE 'supertag:%'")?;
                let ids: Vec<String> = stmt.query_map([], |r| r.get(0))?.filter_map(|r| r.ok()).collect();
                Ok(ids)
            })
            .await?;

        let mut out = Vec::new();
        for sid in candidates {
            if sid == supertag_system_id {
                continue;
            }
            let mut visited = std::collections::HashSet::new();
            let mut current = sid.clone();
            let mut depth = 0;
            loop {
                if depth > MAX_INHERITANCE_DEPTH || !visited.insert(current.clone()) {
                    break;
                }
                match self.supertag_parent(&current).await? {
                    Some(parent) if parent == supertag_system_id => {
                        out.push(sid.clone());
                        break;
                    }
                    Some(parent) => {
                        current = parent;
                        depth += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(out)
    }

    async fn create_node(&self, opts: CreateNodeOptions) -> Result<GraphNode, GraphError> {
        if let Some(sid) = &opts.system_id {
            SystemId::try_from(sid.as_str()).map_err(GraphError::Validation)?;
        }
        let ts = Utc::now();
        let id = NodeId::new();
        let conn = self.conn().await?;

        let id_str = id.to_string();
        let content = opts.content.clone();
        let content_plain = opts.content.as_ref().map(|c| c.to_lowercase());
        let system_id = opts.system_id.clone();
        let owner_id_str = opts.owner_id.map(|o| o.to_string());
        let millis = to_millis(ts);

        conn.with_connection(move |c| {
            if let Some(sid) = &system_id {
                let exists: Option<i64> = c.query_row("SELECT 1 FROM nodes WHERE system_id = ?1", [sid], |r| r.get(0)).optional()?;
                if exists.is_some() {
                    return Err(SqliteError::Ddl(format!("duplicate system id: {sid}")));
                }
            }
            c.execute(
                r#"INSERT INTO nodes(id, content, content_plain, system_id, owner_id, created_at, updated_at, deleted_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL)"#,
                rusqlite::params![id_str, content, content_plain, system_id, owner_id_str, millis],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| match e {
            SqliteError::Ddl(msg) if msg.starts_with("duplicate system id") => {
                GraphError::Validation(ValidationError::DuplicateSystemId(opts.system_id.clone().unwrap_or_default()))
            }
            other => GraphError::Store(other.into()),
        })?;

        let node = GraphNode {
            id,
            content: opts.content.clone(),
            content_plain: opts.content.as_ref().map(|c| c.to_lowercase()),
            system_id: opts.system_id.clone(),
            owner_id: opts.owner_id,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
        };

        self.bus.emit(&MutationEvent::NodeCreated {
            node_id: id,
            system_id: opts.system_id.clone(),
            supertag_system_id: opts.supertag_system_id.clone(),
            timestamp: ts,
        });

        if let Some(supertag) = &opts.supertag_system_id {
            self.add_supertag(id, supertag).await?;
        }
        Ok(node)
    }

    async fn update_content(&self, id: NodeId, content: String) -> Result<GraphNode, GraphError> {
        let node = self.get_node(id).await?.ok_or(ValidationError::NodeNotFound(id))?;
        require_live(&node).map_err(GraphError::Validation)?;
        let ts = Utc::now();
        let before = node.content.clone();

        let conn = self.conn().await?;
        let id_str = id.to_string();
        let content_plain = content.to_lowercase();
        let millis = to_millis(ts);
        let content_clone = content.clone();
        conn.with_connection(move |c| {
            c.execute(
                "UPDATE nodes SET content = ?1, content_plain = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![content_clone, content_plain, millis, id_str],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Store(e.into()))?;

        self.bus.emit(&MutationEvent::NodeUpdated { node_id: id, before_content: before, after_content: Some(content.clone()), timestamp: ts });

        Ok(GraphNode { content: Some(content), updated_at: ts, ..node })
    }

    async fn soft_delete(&self, id: NodeId) -> Result<(), GraphError> {
        let node = self.get_node(id).await?.ok_or(ValidationError::NodeNotFound(id))?;
        require_live(&node).map_err(GraphError::Validation)?;
        let ts = Utc::now();
        let conn = self.conn().await?;
        let id_str = id.to_string();
        let millis = to_millis(ts);
        conn.with_connection(move |c| {
            c.execute("UPDATE nodes SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2", rusqlite::params![millis, id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Store(e.into()))?;
        self.bus.emit(&MutationEvent::NodeDeleted { node_id: id, timestamp: ts });
        Ok(())
    }

    async fn purge(&self, id: NodeId) -> Result<(), GraphError> {
        let conn = self.conn().await?;
        let id_str = id.to_string();
        conn.with_connection(move |c| {
            c.execute("DELETE FROM nodes WHERE id = ?1", [&id_str])?;
            c.execute("DELETE FROM node_properties WHERE node_id = ?1 OR field_node_id = ?1", [&id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Store(e.into()))?;
        Ok(())
    }

    async fn set_property(&self, node_id: NodeId, field_system_id: &str, order: i64, value: Value) -> Result<(), GraphError> {
        let node = self.get_node(node_id).await?.ok_or(ValidationError::NodeNotFound(node_id))?;
        require_live(&node).map_err(GraphError::Validation)?;

        let ts = Utc::now();
        let conn = self.conn().await?;
        let node_id_str = node_id.to_string();
        let field_system_id_owned = field_system_id.to_string();
        let raw = value.to_json().to_string();
        let millis = to_millis(ts);

        let before_value = conn
            .with_connection(move |c| {
                let field_node_id = SqliteGraphStore::field_node_id_for_conn(c, &field_system_id_owned)?;
                let field_node_id_str = field_node_id.to_string();
                let before: Option<String> = c
                    .query_row(
                        r#"SELECT value FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2 AND "order" = ?3"#,
                        rusqlite::params![node_id_str, field_node_id_str, order],
                        |r| r.get(0),
                    )
                    .optional()?;
                c.execute(
                    r#"INSERT INTO node_properties(node_id, field_node_id, value, "order", created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                       ON CONFLICT(node_id, field_node_id, "order") DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
                    rusqlite::params![node_id_str, field_node_id_str, raw, order, millis],
                )?;
                Ok(before.map(|s| Value::from_json_str(&s).unwrap_or(Value::Null)))
            })
            .await
            .map_err(map_field_error)?;

        self.bus.emit(&MutationEvent::PropertySet {
            node_id,
            field_system_id: field_system_id.to_string(),
            order,
            before_value,
            after_value: value,
            timestamp: ts,
        });
        Ok(())
    }

    async fn add_property(&self, node_id: NodeId, field_system_id: &str, value: Value) -> Result<(), GraphError> {
        let conn = self.conn().await?;
        let node_id_str = node_id.to_string();
        let field_system_id_owned = field_system_id.to_string();
        let next_order = conn
            .with_connection(move |c| {
                let field_node_id = SqliteGraphStore::field_node_id_for_conn(c, &field_system_id_owned)?;
                let field_node_id_str = field_node_id.to_string();
                let max: Option<i64> = c
                    .query_row(
                        r#"SELECT MAX("order") FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2"#,
                        rusqlite::params![node_id_str, field_node_id_str],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten();
                Ok(max.map(|m| m + 1).unwrap_or(0))
            })
            .await
            .map_err(map_field_error)?;
        self.set_property(node_id, field_system_id, next_order, value).await
    }

    async fn clear_property(&self, node_id: NodeId, field_system_id: &str) -> Result<(), GraphError> {
        let node = self.get_node(node_id).await?.ok_or(ValidationError::NodeNotFound(node_id))?;
        require_live(&node).map_err(GraphError::Validation)?;

        let ts = Utc::now();
        let conn = self.conn().await?;
        let node_id_str = node_id.to_string();
        let field_system_id_owned = field_system_id.to_string();
        conn.with_connection(move |c| {
            let field_node_id = SqliteGraphStore::field_node_id_for_conn(c, &field_system_id_owned)?;
            let field_node_id_str = field_node_id.to_string();
            c.execute(
                "DELETE FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2",
                rusqlite::params![node_id_str, field_node_id_str],
            )?;
            Ok(())
        })
        .await
        .map_err(map_field_error)?;

        self.bus.emit(&MutationEvent::PropertyCleared { node_id, field_system_id: field_system_id.to_string(), timestamp: ts });
        Ok(())
    }

    async fn add_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        let node = self.get_node(node_id).await?.ok_or(ValidationError::NodeNotFound(node_id))?;
        require_live(&node).map_err(GraphError::Validation)?;

        let ts = Utc::now();
        let conn = self.conn().await?;
        let node_id_str = node_id.to_string();
        let supertag_owned = supertag_system_id.to_string();
        let raw = Value::String(supertag_system_id.to_string()).to_json().to_string();
        let millis = to_millis(ts);

        let inserted = conn
            .with_connection(move |c| {
                let field_node_id = SqliteGraphStore::field_node_id_for_conn(c, well_known::FIELD_SUPERTAG)?;
                let field_node_id_str = field_node_id.to_string();
                let already: Option<i64> = c
                    .query_row(
                        "SELECT 1 FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2 AND value = ?3",
                        rusqlite::params![node_id_str, field_node_id_str, raw],
                        |r| r.get(0),
                    )
                    .optional()?;
                if already.is_some() {
                    return Ok(false);
                }
                let next_order: Option<i64> = c
                    .query_row(
                        r#"SELECT MAX("order") FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2"#,
                        rusqlite::params![node_id_str, field_node_id_str],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten();
                let order = next_order.map(|m| m + 1).unwrap_or(0);
                c.execute(
                    r#"INSERT INTO node_properties(node_id, field_node_id, value, "order", created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?5)"#,
                    rusqlite::params![node_id_str, field_node_id_str, raw, order, millis],
                )?;
                Ok(true)
            })
            .await
            .map_err(map_field_error)?;

        if inserted {
            self.bus.emit(&MutationEvent::SupertagAdded { node_id, supertag_system_id: supertag_system_id.to_string(), timestamp: ts });
        }
        let _ = supertag_owned;
        Ok(())
    }

    async fn remove_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        let ts = Utc::now();
        let conn = self.conn().await?;
        let node_id_str = node_id.to_string();
        let raw = Value::String(supertag_system_id.to_string()).to_json().to_string();

        let removed = conn
            .with_connection(move |c| {
                let field_node_id = SqliteGraphStore::field_node_id_for_conn(c, well_known::FIELD_SUPERTAG)?;
                let field_node_id_str = field_node_id.to_string();
                let affected = c.execute(
                    "DELETE FROM node_properties WHERE node_id = ?1 AND field_node_id = ?2 AND value = ?3",
                    rusqlite::params![node_id_str, field_node_id_str, raw],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(map_field_error)?;

        if removed {
            self.bus.emit(&MutationEvent::SupertagRemoved { node_id, supertag_system_id: supertag_system_id.to_string(), timestamp: ts });
        }
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), GraphError> {
        self.ensure_schema().await.map_err(|e| GraphError::Store(e.into()))?;

        const SEEDS: &[(&str, &str)] = &[
            (well_known::FIELD_SUPERTAG, "Supertag"),
            (well_known::FIELD_EXTENDS, "Extends"),
            (well_known::FIELD_TYPE, "Field Type"),
            (well_known::FIELD_DEFINITION, "Definition"),
            (well_known::SUPERTAG_SUPERTAG, "Supertag"),
            (well_known::SUPERTAG_FIELD, "Field"),
            (well_known::SUPERTAG_SYSTEM, "System"),
            (well_known::SUPERTAG_AUTOMATION, "Automation"),
            (well_known::SUPERTAG_COMPUTED_FIELD, "Computed Field"),
            ("supertag:item", "Item"),
            ("supertag:tag", "Tag"),
            ("supertag:command", "Command"),
        ];

        let conn = self.conn().await?;
        let ts = to_millis(Utc::now());
        let rows: Vec<(String, String, String, String, i64)> =
            SEEDS.iter().map(|(sid, name)| (NodeId::new().to_string(), sid.to_string(), name.to_string(), name.to_lowercase(), ts)).collect();

        conn.with_connection(move |c| {
            for (id, system_id, content, content_plain, ts) in rows {
                c.execute(
                    r#"INSERT OR IGNORE INTO nodes(id, content, content_plain, system_id, owner_id, created_at, updated_at, deleted_at)
                       VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5, NULL)"#,
                    rusqlite::params![id, content, content_plain, system_id, ts],
                )?;
            }
            Ok(())
        })
        .await
        .map_err(|e| GraphError::Store(e.into()))
    }
}

impl SqliteGraphStore {
    fn field_node_id_for_conn(conn: &Connection, field_system_id: &str) -> Result<NodeId, SqliteError> {
        let row: Option<String> = conn.query_row("SELECT id FROM nodes WHERE system_id = ?1", [field_system_id], |r| r.get(0)).optional()?;
        match row.and_then(|s| NodeId::from_str(&s).ok()) {
            Some(id) => Ok(id),
            None => Err(SqliteError::Ddl(format!("unknown field: {field_system_id}"))),
        }
    }
}

fn map_field_error(e: SqliteError) -> GraphError {
    match &e {
        SqliteError::Ddl(msg) if msg.starts_with("unknown field: ") => {
            GraphError::Validation(ValidationError::UnknownField(msg.trim_start_matches("unknown field: ").to_string()))
        }
        _ => GraphError::Store(e.into()),
    }
}

fn property_row_from(row: &rusqlite::Row, node_id: NodeId) -> rusqlite::Result<PropertyRow> {
    let row_id: i64 = row.get("id")?;
    let field_node_id_str: String = row.get("field_node_id")?;
    let field_node_id = NodeId::from_str(&field_node_id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(std::io::Error::other(e.to_string())))
    })?;
    Ok(PropertyRow {
        row_id,
        node_id,
        field_node_id,
        raw_value: row.get("value")?,
        order: row.get("order")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use graph_core::store::CreateNodeOptions;

    use super::*;

    async fn open() -> SqliteGraphStore {
        let bus = Arc::new(EventBus::new());
        let store = SqliteGraphStore::open_in_memory(bus).await.unwrap();
        store.bootstrap().await.unwrap();
        store
    }

    #[tokio::test]
    async fn bootstrap_seeds_well_known_fields() {
        let store = open().await;
        assert!(store.get_node_by_system_id(well_known::FIELD_SUPERTAG, false).await.unwrap().is_some());
        assert!(store.get_node_by_system_id(well_known::FIELD_DEFINITION, false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = open().await;
        store.bootstrap().await.unwrap();
        let ids = store.list_live_node_ids().await.unwrap();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[tokio::test]
    async fn create_node_rejects_duplicate_system_id() {
        let store = open().await;
        store.create_node(CreateNodeOptions { system_id: Some("item:one".into()), ..Default::default() }).await.unwrap();
        let err = store.create_node(CreateNodeOptions { system_id: Some("item:one".into()), ..Default::default() }).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(ValidationError::DuplicateSystemId(_))));
    }

    #[tokio::test]
    async fn set_property_round_trips_through_assemble() {
        let store = open().await;
        let node = store.create_node(CreateNodeOptions { content: Some("Widget".into()), ..Default::default() }).await.unwrap();
        store.add_supertag(node.id, "supertag:item").await.unwrap();
        store.set_property(node.id, well_known::FIELD_TYPE, 0, Value::String("gadget".into())).await.unwrap();

        let assembled = store.assemble(node.id).await.unwrap().unwrap();
        assert_eq!(assembled.value(well_known::FIELD_TYPE), Some(Value::String("gadget".into())));
        assert!(assembled.has_supertag("supertag:item"));
    }

    #[tokio::test]
    async fn soft_delete_excludes_node_from_assembly() {
        let store = open().await;
        let node = store.create_node(CreateNodeOptions::default()).await.unwrap();
        store.soft_delete(node.id).await.unwrap();
        assert!(store.assemble(node.id).await.unwrap().is_none());
        assert!(store.get_node(node.id).await.unwrap().unwrap().deleted_at.is_some());
    }

    #[tokio::test]
    async fn inheritance_merges_supertag_defaults() {
        let store = open().await;
        let parent = store.create_node(CreateNodeOptions { system_id: Some("supertag:widget".into()), ..Default::default() }).await.unwrap();
        store.set_property(parent.id, well_known::FIELD_TYPE, 0, Value::String("default-kind".into())).await.unwrap();

        let node = store.create_node(CreateNodeOptions::default()).await.unwrap();
        store.add_supertag(node.id, "supertag:widget").await.unwrap();

        let assembled = store.assemble_inherited(node.id).await.unwrap().unwrap();
        assert_eq!(assembled.value(well_known::FIELD_TYPE), Some(Value::String("default-kind".into())));
    }
}
