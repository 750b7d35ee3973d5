//! Container records.
//!
//! A container ties a runtime, an optional spec and a snapshot together.
//! The runtime and snapshotter are fixed at creation.

use crate::Db;
use crate::events::Event;
use crate::fields::{self, MapUpdate};
use crate::kv::{self, KvRead, KvWrite, Path};
use crate::schema::{
    self, KEY_EXTENSIONS, KEY_IMAGE, KEY_LABELS, KEY_NAME, KEY_OPTIONS, KEY_RUNTIME, KEY_SANDBOX_ID,
    KEY_SNAPSHOT_KEY, KEY_SNAPSHOTTER, KEY_SPEC, KEY_UPDATED_AT,
};
use crate::tx::Context;
use berth_common::filters::label_field;
use berth_common::types::{Timestamp, now, validate_identifier};
use berth_common::{Adaptor, Any, Error, Filter, Labels, Result, labels};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runtime handling a container or sandbox
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub name: String,
    pub options: Option<Any>,
}

impl RuntimeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub labels: Labels,
    pub image: String,
    pub runtime: RuntimeInfo,
    pub spec: Option<Any>,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub sandbox_id: String,
    pub extensions: BTreeMap<String, Any>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Container {
    pub fn new(id: impl Into<String>, runtime: RuntimeInfo) -> Self {
        Self {
            id: id.into(),
            runtime,
            ..Self::default()
        }
    }
}

impl Adaptor for Container {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "id" => Some(self.id.clone()),
            "image" => Some(self.image.clone()),
            "runtime" => match fieldpath.get(1).map(String::as_str)? {
                "name" => Some(self.runtime.name.clone()),
                _ => None,
            },
            "snapshotter" => Some(self.snapshotter.clone()),
            "snapshotkey" => Some(self.snapshot_key.clone()),
            "sandboxid" => Some(self.sandbox_id.clone()),
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            _ => None,
        }
    }
}

/// Change to a map of extensions requested through field paths
#[derive(Clone, Debug)]
pub(crate) enum ExtensionUpdate {
    Replace(BTreeMap<String, Any>),
    Key(String, Option<Any>),
}

impl ExtensionUpdate {
    pub(crate) fn merge(&self, current: &mut BTreeMap<String, Any>) {
        match self {
            Self::Replace(map) => current.clone_from(map),
            Self::Key(k, Some(v)) => {
                current.insert(k.clone(), v.clone());
            }
            Self::Key(k, None) => {
                current.remove(k);
            }
        }
    }

    pub(crate) fn apply<K: KvWrite + ?Sized>(&self, kv: &mut K, bucket: &Path) -> Result<()> {
        match self {
            Self::Replace(map) => fields::write_extensions(kv, bucket, map)?,
            Self::Key(k, v) => fields::write_any(kv, &bucket.join(k), v.as_ref())?,
        }
        Ok(())
    }
}

/// One requested container change
enum Change {
    Labels(MapUpdate),
    Extensions(ExtensionUpdate),
    Spec,
    Image,
    SnapshotKey,
    All,
}

pub struct ContainerStore {
    db: Arc<Db>,
}

impl ContainerStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn get(&self, ctx: &Context<'_>, id: &str) -> Result<Container> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?
                .view(|kv| read(kv, ns, id)?.ok_or_else(|| Error::not_found(format!("container {id:?}"))))
        })
    }

    pub fn list(&self, ctx: &Context<'_>, filters: &[&str]) -> Result<Vec<Container>> {
        let filter = Filter::parse_all(filters)?;
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                let mut out = Vec::new();
                for id in ids(kv, ns)? {
                    if let Some(c) = read(kv, ns, &id)?
                        && filter.matches(&c)
                    {
                        out.push(c);
                    }
                }
                Ok(out)
            })
        })
    }

    pub fn create(&self, ctx: &Context<'_>, container: Container) -> Result<Container> {
        validate(&container)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let created = tx.update(|kv| {
                schema::ensure_namespace(kv, ns)?;
                let path = schema::container(ns, &container.id);
                if !kv::create_bucket(kv, &path)? {
                    return Err(Error::already_exists(format!("container {:?}", container.id)));
                }
                let ts = now();
                let created = Container {
                    created_at: ts,
                    updated_at: ts,
                    ..container
                };
                write_record(kv, &path, &created)?;
                Ok(created)
            })?;
            tx.publish(
                ns,
                Event::ContainerCreate {
                    id: created.id.clone(),
                    image: created.image.clone(),
                    runtime: created.runtime.name.clone(),
                },
            );
            Ok(created)
        })
    }

    /// Update a container.
    ///
    /// Accepted field paths are `labels`, `labels.<key>`, `extensions`,
    /// `extensions.<key>`, `spec`, `image` and `snapshotkey`. Without field
    /// paths every mutable field is replaced; the runtime and snapshotter
    /// must then match the stored ones.
    pub fn update(&self, ctx: &Context<'_>, container: &Container, fieldpaths: &[&str]) -> Result<Container> {
        if container.id.is_empty() {
            return Err(Error::invalid_argument("container id must be set"));
        }
        let changes = plan(container, fieldpaths)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let updated = tx.update(|kv| {
                let path = schema::container(ns, &container.id);
                let mut updated = read(kv, ns, &container.id)?
                    .ok_or_else(|| Error::not_found(format!("container {:?}", container.id)))?;

                for change in &changes {
                    match change {
                        Change::Labels(m) => m.merge(&mut updated.labels),
                        Change::Extensions(e) => e.merge(&mut updated.extensions),
                        Change::Spec => updated.spec.clone_from(&container.spec),
                        Change::Image => updated.image.clone_from(&container.image),
                        Change::SnapshotKey => updated.snapshot_key.clone_from(&container.snapshot_key),
                        Change::All => {
                            if container.runtime.name != updated.runtime.name {
                                return Err(Error::invalid_argument(format!(
                                    "container {:?}: runtime name is immutable",
                                    container.id
                                )));
                            }
                            if container.snapshotter != updated.snapshotter {
                                return Err(Error::invalid_argument(format!(
                                    "container {:?}: snapshotter is immutable",
                                    container.id
                                )));
                            }
                            updated = Container {
                                created_at: updated.created_at,
                                updated_at: updated.updated_at,
                                ..container.clone()
                            };
                        }
                    }
                }
                validate(&updated)?;

                updated.updated_at = now();
                for change in &changes {
                    match change {
                        Change::Labels(m) => m.apply(kv, &path.join(KEY_LABELS))?,
                        Change::Extensions(e) => e.apply(kv, &path.join(KEY_EXTENSIONS))?,
                        Change::Spec => fields::write_any(kv, &path.join(KEY_SPEC), updated.spec.as_ref())?,
                        Change::Image => fields::write_optional_string(kv, &path.join(KEY_IMAGE), &updated.image)?,
                        Change::SnapshotKey => {
                            fields::write_optional_string(kv, &path.join(KEY_SNAPSHOT_KEY), &updated.snapshot_key)?;
                        }
                        Change::All => write_record(kv, &path, &updated)?,
                    }
                }
                fields::write_timestamp(kv, &path.join(KEY_UPDATED_AT), &updated.updated_at)?;
                Ok(updated)
            })?;
            tx.publish(
                ns,
                Event::ContainerUpdate {
                    id: updated.id.clone(),
                    image: updated.image.clone(),
                    snapshot_key: updated.snapshot_key.clone(),
                },
            );
            Ok(updated)
        })
    }

    /// Decode the spec through the database's type registry
    pub fn spec_as<T: 'static>(&self, container: &Container) -> Result<Option<T>> {
        container
            .spec
            .as_ref()
            .map(|any| self.db.types().decode_as(any))
            .transpose()
    }

    /// Decode the extension stored as `name`
    pub fn extension_as<T: 'static>(&self, container: &Container, name: &str) -> Result<T> {
        let any = container.extensions.get(name).ok_or_else(|| {
            Error::not_found(format!("extension {name:?} on container {:?}", container.id))
        })?;
        self.db.types().decode_as(any)
    }

    pub fn delete(&self, ctx: &Context<'_>, id: &str) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            tx.update(|kv| {
                if !kv::delete_bucket(kv, &schema::container(ns, id))? {
                    return Err(Error::not_found(format!("container {id:?}")));
                }
                Ok(())
            })?;
            tx.mark_dirty();
            tx.publish(ns, Event::ContainerDelete { id: id.to_string() });
            Ok(())
        })
    }
}

fn validate(c: &Container) -> Result<()> {
    validate_identifier(&c.id).map_err(|e| e.context("container"))?;
    labels::validate_all(&c.labels)?;
    validate_extensions(&c.extensions)?;
    if c.runtime.name.is_empty() {
        return Err(Error::invalid_argument(format!(
            "container {:?}: runtime name must be set",
            c.id
        )));
    }
    if !c.snapshot_key.is_empty() && c.snapshotter.is_empty() {
        return Err(Error::invalid_argument(format!(
            "container {:?}: snapshotter must be set with a snapshot key",
            c.id
        )));
    }
    Ok(())
}

pub(crate) fn validate_extensions(extensions: &BTreeMap<String, Any>) -> Result<()> {
    for name in extensions.keys() {
        kv::check_component("extension name", name)?;
    }
    Ok(())
}

fn plan(c: &Container, fieldpaths: &[&str]) -> Result<Vec<Change>> {
    if fieldpaths.is_empty() {
        return Ok(vec![Change::All]);
    }
    fieldpaths
        .iter()
        .map(|path| {
            if let Some(key) = path.strip_prefix("labels.").filter(|k| !k.is_empty()) {
                return Ok(Change::Labels(MapUpdate::Keys(vec![(
                    key.to_string(),
                    c.labels.get(key).cloned(),
                )])));
            }
            if let Some(key) = path.strip_prefix("extensions.").filter(|k| !k.is_empty()) {
                return Ok(Change::Extensions(ExtensionUpdate::Key(
                    key.to_string(),
                    c.extensions.get(key).cloned(),
                )));
            }
            match *path {
                KEY_LABELS => Ok(Change::Labels(MapUpdate::Replace(c.labels.clone()))),
                KEY_EXTENSIONS => Ok(Change::Extensions(ExtensionUpdate::Replace(c.extensions.clone()))),
                KEY_SPEC => Ok(Change::Spec),
                KEY_IMAGE => Ok(Change::Image),
                KEY_SNAPSHOT_KEY => Ok(Change::SnapshotKey),
                _ => Err(Error::invalid_argument(format!(
                    "cannot update {path:?} field on container {:?}",
                    c.id
                ))),
            }
        })
        .collect()
}

pub(crate) fn write_runtime<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, runtime: &RuntimeInfo) -> Result<()> {
    fields::write_string(kv, &path.join(KEY_NAME), &runtime.name)?;
    fields::write_any(kv, &path.join(KEY_OPTIONS), runtime.options.as_ref())?;
    Ok(())
}

pub(crate) fn read_runtime<K: KvRead + ?Sized>(kv: &K, path: &Path) -> Result<RuntimeInfo> {
    Ok(RuntimeInfo {
        name: fields::read_string(kv, &path.join(KEY_NAME))?.unwrap_or_default(),
        options: fields::read_any(kv, &path.join(KEY_OPTIONS))?,
    })
}

fn write_record<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, c: &Container) -> Result<()> {
    fields::write_timestamps(kv, path, &c.created_at, &c.updated_at)?;
    fields::write_optional_string(kv, &path.join(KEY_IMAGE), &c.image)?;
    write_runtime(kv, &path.join(KEY_RUNTIME), &c.runtime)?;
    fields::write_any(kv, &path.join(KEY_SPEC), c.spec.as_ref())?;
    fields::write_optional_string(kv, &path.join(KEY_SNAPSHOTTER), &c.snapshotter)?;
    fields::write_optional_string(kv, &path.join(KEY_SNAPSHOT_KEY), &c.snapshot_key)?;
    fields::write_optional_string(kv, &path.join(KEY_SANDBOX_ID), &c.sandbox_id)?;
    fields::write_map(kv, &path.join(KEY_LABELS), &c.labels)?;
    fields::write_extensions(kv, &path.join(KEY_EXTENSIONS), &c.extensions)?;
    Ok(())
}

pub(crate) fn read<K: KvRead + ?Sized>(kv: &K, ns: &str, id: &str) -> Result<Option<Container>> {
    let path = schema::container(ns, id);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let (created_at, updated_at) = fields::read_timestamps(kv, &path)?;
    Ok(Some(Container {
        id: id.to_string(),
        labels: fields::read_map(kv, &path.join(KEY_LABELS))?,
        image: fields::read_string(kv, &path.join(KEY_IMAGE))?.unwrap_or_default(),
        runtime: read_runtime(kv, &path.join(KEY_RUNTIME))?,
        spec: fields::read_any(kv, &path.join(KEY_SPEC))?,
        snapshotter: fields::read_string(kv, &path.join(KEY_SNAPSHOTTER))?.unwrap_or_default(),
        snapshot_key: fields::read_string(kv, &path.join(KEY_SNAPSHOT_KEY))?.unwrap_or_default(),
        sandbox_id: fields::read_string(kv, &path.join(KEY_SANDBOX_ID))?.unwrap_or_default(),
        extensions: fields::read_extensions(kv, &path.join(KEY_EXTENSIONS))?,
        created_at,
        updated_at,
    }))
}

pub(crate) fn ids<K: KvRead + ?Sized>(kv: &K, ns: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::containers(ns))?)
}
