//! Sandbox records.

use crate::Db;
use crate::containers::{ExtensionUpdate, RuntimeInfo, read_runtime, validate_extensions, write_runtime};
use crate::events::Event;
use crate::fields::{self, MapUpdate};
use crate::kv::{self, KvRead, KvWrite, Path};
use crate::schema::{self, KEY_EXTENSIONS, KEY_LABELS, KEY_RUNTIME, KEY_SANDBOXER, KEY_SPEC, KEY_UPDATED_AT};
use crate::tx::Context;
use berth_common::filters::label_field;
use berth_common::types::{Timestamp, now, validate_identifier};
use berth_common::{Adaptor, Any, Error, Filter, Labels, Result, labels};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sandbox {
    pub id: String,
    pub labels: Labels,
    pub runtime: RuntimeInfo,
    pub spec: Option<Any>,
    pub sandboxer: String,
    pub extensions: BTreeMap<String, Any>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Sandbox {
    pub fn new(id: impl Into<String>, runtime: RuntimeInfo) -> Self {
        Self {
            id: id.into(),
            runtime,
            ..Self::default()
        }
    }
}

impl Adaptor for Sandbox {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "id" => Some(self.id.clone()),
            "runtime" => match fieldpath.get(1).map(String::as_str)? {
                "name" => Some(self.runtime.name.clone()),
                _ => None,
            },
            "sandboxer" => Some(self.sandboxer.clone()),
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            _ => None,
        }
    }
}

enum Change {
    Labels(MapUpdate),
    Extensions(ExtensionUpdate),
    Spec,
    Runtime,
    Sandboxer,
}

pub struct SandboxStore {
    db: Arc<Db>,
}

impl SandboxStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn get(&self, ctx: &Context<'_>, id: &str) -> Result<Sandbox> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?
                .view(|kv| read(kv, ns, id)?.ok_or_else(|| Error::not_found(format!("sandbox {id:?}"))))
        })
    }

    pub fn list(&self, ctx: &Context<'_>, filters: &[&str]) -> Result<Vec<Sandbox>> {
        let filter = Filter::parse_all(filters)?;
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                let mut out = Vec::new();
                for id in ids(kv, ns)? {
                    if let Some(sb) = read(kv, ns, &id)?
                        && filter.matches(&sb)
                    {
                        out.push(sb);
                    }
                }
                Ok(out)
            })
        })
    }

    pub fn create(&self, ctx: &Context<'_>, sandbox: Sandbox) -> Result<Sandbox> {
        validate(&sandbox)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let created = tx.update(|kv| {
                schema::ensure_namespace(kv, ns)?;
                let path = schema::sandbox(ns, &sandbox.id);
                if !kv::create_bucket(kv, &path)? {
                    return Err(Error::already_exists(format!("sandbox {:?}", sandbox.id)));
                }
                let ts = now();
                let created = Sandbox {
                    created_at: ts,
                    updated_at: ts,
                    ..sandbox
                };
                write_record(kv, &path, &created)?;
                Ok(created)
            })?;
            tx.publish(ns, Event::SandboxCreate { id: created.id.clone() });
            Ok(created)
        })
    }

    /// Update a sandbox.
    ///
    /// Accepted field paths are `labels`, `labels.<key>`, `extensions`,
    /// `extensions.<key>`, `spec`, `runtime` and `sandboxer`; without field
    /// paths all of them are replaced.
    pub fn update(&self, ctx: &Context<'_>, sandbox: &Sandbox, fieldpaths: &[&str]) -> Result<Sandbox> {
        if sandbox.id.is_empty() {
            return Err(Error::invalid_argument("sandbox id must be set"));
        }
        let changes = plan(sandbox, fieldpaths)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let updated = tx.update(|kv| {
                let path = schema::sandbox(ns, &sandbox.id);
                let mut updated = read(kv, ns, &sandbox.id)?
                    .ok_or_else(|| Error::not_found(format!("sandbox {:?}", sandbox.id)))?;
                for change in &changes {
                    match change {
                        Change::Labels(m) => m.merge(&mut updated.labels),
                        Change::Extensions(e) => e.merge(&mut updated.extensions),
                        Change::Spec => updated.spec.clone_from(&sandbox.spec),
                        Change::Runtime => updated.runtime.clone_from(&sandbox.runtime),
                        Change::Sandboxer => updated.sandboxer.clone_from(&sandbox.sandboxer),
                    }
                }
                validate(&updated)?;

                for change in &changes {
                    match change {
                        Change::Labels(m) => m.apply(kv, &path.join(KEY_LABELS))?,
                        Change::Extensions(e) => e.apply(kv, &path.join(KEY_EXTENSIONS))?,
                        Change::Spec => fields::write_any(kv, &path.join(KEY_SPEC), updated.spec.as_ref())?,
                        Change::Runtime => write_runtime(kv, &path.join(KEY_RUNTIME), &updated.runtime)?,
                        Change::Sandboxer => {
                            fields::write_optional_string(kv, &path.join(KEY_SANDBOXER), &updated.sandboxer)?;
                        }
                    }
                }
                updated.updated_at = now();
                fields::write_timestamp(kv, &path.join(KEY_UPDATED_AT), &updated.updated_at)?;
                Ok(updated)
            })?;
            tx.publish(ns, Event::SandboxUpdate { id: updated.id.clone() });
            Ok(updated)
        })
    }

    pub fn delete(&self, ctx: &Context<'_>, id: &str) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            tx.update(|kv| {
                if !kv::delete_bucket(kv, &schema::sandbox(ns, id))? {
                    return Err(Error::not_found(format!("sandbox {id:?}")));
                }
                Ok(())
            })?;
            tx.mark_dirty();
            tx.publish(ns, Event::SandboxDelete { id: id.to_string() });
            Ok(())
        })
    }
}

fn validate(sb: &Sandbox) -> Result<()> {
    validate_identifier(&sb.id).map_err(|e| e.context("sandbox"))?;
    labels::validate_all(&sb.labels)?;
    validate_extensions(&sb.extensions)?;
    if sb.runtime.name.is_empty() {
        return Err(Error::invalid_argument(format!(
            "sandbox {:?}: runtime name must be set",
            sb.id
        )));
    }
    Ok(())
}

fn plan(sb: &Sandbox, fieldpaths: &[&str]) -> Result<Vec<Change>> {
    if fieldpaths.is_empty() {
        return Ok(vec![
            Change::Labels(MapUpdate::Replace(sb.labels.clone())),
            Change::Extensions(ExtensionUpdate::Replace(sb.extensions.clone())),
            Change::Spec,
            Change::Runtime,
            Change::Sandboxer,
        ]);
    }
    fieldpaths
        .iter()
        .map(|path| {
            if let Some(key) = path.strip_prefix("labels.").filter(|k| !k.is_empty()) {
                return Ok(Change::Labels(MapUpdate::Keys(vec![(
                    key.to_string(),
                    sb.labels.get(key).cloned(),
                )])));
            }
            if let Some(key) = path.strip_prefix("extensions.").filter(|k| !k.is_empty()) {
                return Ok(Change::Extensions(ExtensionUpdate::Key(
                    key.to_string(),
                    sb.extensions.get(key).cloned(),
                )));
            }
            match *path {
                KEY_LABELS => Ok(Change::Labels(MapUpdate::Replace(sb.labels.clone()))),
                KEY_EXTENSIONS => Ok(Change::Extensions(ExtensionUpdate::Replace(sb.extensions.clone()))),
                KEY_SPEC => Ok(Change::Spec),
                KEY_RUNTIME => Ok(Change::Runtime),
                KEY_SANDBOXER => Ok(Change::Sandboxer),
                _ => Err(Error::invalid_argument(format!(
                    "cannot update {path:?} field on sandbox {:?}",
                    sb.id
                ))),
            }
        })
        .collect()
}

fn write_record<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, sb: &Sandbox) -> Result<()> {
    fields::write_timestamps(kv, path, &sb.created_at, &sb.updated_at)?;
    write_runtime(kv, &path.join(KEY_RUNTIME), &sb.runtime)?;
    fields::write_any(kv, &path.join(KEY_SPEC), sb.spec.as_ref())?;
    fields::write_optional_string(kv, &path.join(KEY_SANDBOXER), &sb.sandboxer)?;
    fields::write_map(kv, &path.join(KEY_LABELS), &sb.labels)?;
    fields::write_extensions(kv, &path.join(KEY_EXTENSIONS), &sb.extensions)?;
    Ok(())
}

pub(crate) fn read<K: KvRead + ?Sized>(kv: &K, ns: &str, id: &str) -> Result<Option<Sandbox>> {
    let path = schema::sandbox(ns, id);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let (created_at, updated_at) = fields::read_timestamps(kv, &path)?;
    Ok(Some(Sandbox {
        id: id.to_string(),
        labels: fields::read_map(kv, &path.join(KEY_LABELS))?,
        runtime: read_runtime(kv, &path.join(KEY_RUNTIME))?,
        spec: fields::read_any(kv, &path.join(KEY_SPEC))?,
        sandboxer: fields::read_string(kv, &path.join(KEY_SANDBOXER))?.unwrap_or_default(),
        extensions: fields::read_extensions(kv, &path.join(KEY_EXTENSIONS))?,
        created_at,
        updated_at,
    }))
}

pub(crate) fn ids<K: KvRead + ?Sized>(kv: &K, ns: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::sandboxes(ns))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbOptions;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, SandboxStore) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("meta.redb"), DbOptions::default()).unwrap();
        (dir, SandboxStore::new(Arc::new(db)))
    }

    fn ctx() -> Context<'static> {
        Context::with_namespace_only("default")
    }

    fn sandbox(id: &str) -> Sandbox {
        let mut sb = Sandbox::new(id, RuntimeInfo::new("io.containerd.runc.v2"));
        sb.sandboxer = "shim".into();
        sb.labels = labels::from_pairs([("a", "1")]);
        sb
    }

    #[test]
    fn test_crud() {
        let (_dir, ss) = open();
        let created = ss.create(&ctx(), sandbox("sb1")).unwrap();
        assert_eq!(ss.get(&ctx(), "sb1").unwrap(), created);
        assert!(ss.create(&ctx(), sandbox("sb1")).unwrap_err().is_already_exists());

        let mut change = sandbox("sb1");
        change.runtime = RuntimeInfo::new("io.containerd.kata.v2");
        change.labels.insert("b".into(), "2".into());
        let updated = ss.update(&ctx(), &change, &["runtime", "labels.b"]).unwrap();
        assert_eq!(updated.runtime.name, "io.containerd.kata.v2");
        assert_eq!(updated.labels, labels::from_pairs([("a", "1"), ("b", "2")]));
        assert_eq!(ss.get(&ctx(), "sb1").unwrap(), updated);

        assert!(ss.update(&ctx(), &change, &["id"]).unwrap_err().is_invalid_argument());

        change.runtime.name.clear();
        assert!(ss.update(&ctx(), &change, &[]).unwrap_err().is_invalid_argument());

        assert_eq!(ss.list(&ctx(), &["sandboxer==shim"]).unwrap().len(), 1);
        ss.delete(&ctx(), "sb1").unwrap();
        assert!(ss.get(&ctx(), "sb1").unwrap_err().is_not_found());
        assert!(ss.delete(&ctx(), "sb1").unwrap_err().is_not_found());
    }
}
