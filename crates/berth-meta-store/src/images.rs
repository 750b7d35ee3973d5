//! Image records: a name pointing at a target descriptor.

use crate::Db;
use crate::error::corrupt;
use crate::events::Event;
use crate::fields::{self, MapUpdate};
use crate::kv::{self, KvRead, KvWrite, Path, check_component};
use crate::schema::{
    self, KEY_ANNOTATIONS, KEY_DIGEST, KEY_LABELS, KEY_MEDIA_TYPE, KEY_PLATFORM, KEY_SIZE,
    KEY_TARGET, KEY_UPDATED_AT,
};
use crate::tx::Context;
use berth_common::filters::label_field;
use berth_common::types::{Timestamp, now};
use berth_common::{Adaptor, Descriptor, Digest, Error, Filter, Labels, Platform, Result, labels};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
    pub labels: Labels,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Image {
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        Self {
            name: name.into(),
            target,
            labels: Labels::new(),
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl Adaptor for Image {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "name" => Some(self.name.clone()),
            "target" => match fieldpath.get(1).map(String::as_str)? {
                "digest" => Some(self.target.digest.to_string()),
                "mediatype" => Some(self.target.media_type.clone()),
                _ => None,
            },
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            "annotations" => label_field(&self.target.annotations, &fieldpath[1..]),
            _ => None,
        }
    }
}

/// One requested image change
enum Change {
    Labels(MapUpdate),
    Annotations(MapUpdate),
    Target,
}

pub struct ImageStore {
    db: Arc<Db>,
}

impl ImageStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn get(&self, ctx: &Context<'_>, name: &str) -> Result<Image> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?
                .view(|kv| read(kv, ns, name)?.ok_or_else(|| Error::not_found(format!("image {name:?}"))))
        })
    }

    pub fn list(&self, ctx: &Context<'_>, filters: &[&str]) -> Result<Vec<Image>> {
        let filter = Filter::parse_all(filters)?;
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                let mut out = Vec::new();
                for name in names(kv, ns)? {
                    if let Some(image) = read(kv, ns, &name)?
                        && filter.matches(&image)
                    {
                        out.push(image);
                    }
                }
                Ok(out)
            })
        })
    }

    pub fn create(&self, ctx: &Context<'_>, image: Image) -> Result<Image> {
        validate(&image)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let created = tx.update(|kv| {
                schema::ensure_namespace(kv, ns)?;
                let path = schema::image(ns, &image.name);
                if !kv::create_bucket(kv, &path)? {
                    return Err(Error::already_exists(format!("image {:?}", image.name)));
                }
                let ts = now();
                fields::write_timestamps(kv, &path, &ts, &ts)?;
                write_target(kv, &path.join(KEY_TARGET), &image.target)?;
                fields::write_map(kv, &path.join(KEY_LABELS), &image.labels)?;
                Ok(Image {
                    created_at: ts,
                    updated_at: ts,
                    ..image
                })
            })?;
            tx.publish(
                ns,
                Event::ImageCreate {
                    name: created.name.clone(),
                    labels: created.labels.clone(),
                },
            );
            Ok(created)
        })
    }

    /// Update an image.
    ///
    /// Accepted field paths are `labels`, `labels.<key>`, `target`,
    /// `annotations` and `annotations.<key>` (annotations of the target).
    /// Without field paths the labels and target are replaced.
    pub fn update(&self, ctx: &Context<'_>, image: &Image, fieldpaths: &[&str]) -> Result<Image> {
        check_component("image name", &image.name)?;
        let changes = plan(image, fieldpaths)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let updated = tx.update(|kv| {
                let path = schema::image(ns, &image.name);
                let mut updated = read(kv, ns, &image.name)?
                    .ok_or_else(|| Error::not_found(format!("image {:?}", image.name)))?;
                for change in &changes {
                    match change {
                        Change::Labels(m) => m.merge(&mut updated.labels),
                        Change::Annotations(m) => m.merge(&mut updated.target.annotations),
                        Change::Target => updated.target = image.target.clone(),
                    }
                }
                validate(&updated)?;

                for change in &changes {
                    match change {
                        Change::Labels(m) => m.apply(kv, &path.join(KEY_LABELS))?,
                        Change::Annotations(m) => {
                            m.apply(kv, &path.join(KEY_TARGET).join(KEY_ANNOTATIONS))?;
                        }
                        Change::Target => write_target(kv, &path.join(KEY_TARGET), &updated.target)?,
                    }
                }
                updated.updated_at = now();
                fields::write_timestamp(kv, &path.join(KEY_UPDATED_AT), &updated.updated_at)?;
                Ok(updated)
            })?;
            tx.publish(
                ns,
                Event::ImageUpdate {
                    name: updated.name.clone(),
                    labels: updated.labels.clone(),
                },
            );
            Ok(updated)
        })
    }

    pub fn delete(&self, ctx: &Context<'_>, name: &str) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            tx.update(|kv| {
                if !remove_record(kv, ns, name)? {
                    return Err(Error::not_found(format!("image {name:?}")));
                }
                Ok(())
            })?;
            tx.mark_dirty();
            tx.publish(ns, Event::ImageDelete { name: name.to_string() });
            Ok(())
        })
    }
}

fn validate(image: &Image) -> Result<()> {
    check_component("image name", &image.name)?;
    labels::validate_all(&image.labels)?;
    if image.target.media_type.is_empty() {
        return Err(Error::invalid_argument(format!(
            "image {:?}: target media type must be set",
            image.name
        )));
    }
    if image.target.size < 0 {
        return Err(Error::invalid_argument(format!(
            "image {:?}: target size must not be negative",
            image.name
        )));
    }
    Ok(())
}

fn plan(image: &Image, fieldpaths: &[&str]) -> Result<Vec<Change>> {
    if fieldpaths.is_empty() {
        return Ok(vec![Change::Labels(MapUpdate::Replace(image.labels.clone())), Change::Target]);
    }
    fieldpaths
        .iter()
        .map(|path| {
            if let Some(key) = path.strip_prefix("labels.").filter(|k| !k.is_empty()) {
                return Ok(Change::Labels(MapUpdate::Keys(vec![(
                    key.to_string(),
                    image.labels.get(key).cloned(),
                )])));
            }
            if let Some(key) = path.strip_prefix("annotations.").filter(|k| !k.is_empty()) {
                return Ok(Change::Annotations(MapUpdate::Keys(vec![(
                    key.to_string(),
                    image.target.annotations.get(key).cloned(),
                )])));
            }
            match *path {
                KEY_LABELS => Ok(Change::Labels(MapUpdate::Replace(image.labels.clone()))),
                KEY_ANNOTATIONS => Ok(Change::Annotations(MapUpdate::Replace(
                    image.target.annotations.clone(),
                ))),
                KEY_TARGET => Ok(Change::Target),
                _ => Err(Error::invalid_argument(format!(
                    "cannot update {path:?} field on image {:?}",
                    image.name
                ))),
            }
        })
        .collect()
}

fn write_target<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, target: &Descriptor) -> Result<()> {
    kv::delete_bucket(kv, path)?;
    kv::create_bucket(kv, path)?;
    fields::write_string(kv, &path.join(KEY_MEDIA_TYPE), &target.media_type)?;
    fields::write_string(kv, &path.join(KEY_DIGEST), target.digest.as_str())?;
    fields::write_varint(kv, &path.join(KEY_SIZE), target.size)?;
    if let Some(platform) = &target.platform {
        fields::write_json(kv, &path.join(KEY_PLATFORM), platform)?;
    }
    fields::write_map(kv, &path.join(KEY_ANNOTATIONS), &target.annotations)?;
    Ok(())
}

fn read_target<K: KvRead + ?Sized>(kv: &K, path: &Path) -> Result<Descriptor> {
    let digest = fields::read_string(kv, &path.join(KEY_DIGEST))?
        .ok_or_else(|| corrupt(path, "missing target digest"))?;
    Ok(Descriptor {
        media_type: fields::read_string(kv, &path.join(KEY_MEDIA_TYPE))?.unwrap_or_default(),
        digest: Digest::parse(digest).map_err(|e| corrupt(path, e))?,
        size: fields::read_varint(kv, &path.join(KEY_SIZE))?.unwrap_or_default(),
        platform: fields::read_json::<_, Platform>(kv, &path.join(KEY_PLATFORM))?,
        annotations: fields::read_map(kv, &path.join(KEY_ANNOTATIONS))?,
    })
}

pub(crate) fn read<K: KvRead + ?Sized>(kv: &K, ns: &str, name: &str) -> Result<Option<Image>> {
    let path = schema::image(ns, name);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let (created_at, updated_at) = fields::read_timestamps(kv, &path)?;
    Ok(Some(Image {
        name: name.to_string(),
        target: read_target(kv, &path.join(KEY_TARGET))?,
        labels: fields::read_map(kv, &path.join(KEY_LABELS))?,
        created_at,
        updated_at,
    }))
}

pub(crate) fn names<K: KvRead + ?Sized>(kv: &K, ns: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::images(ns))?)
}

pub(crate) fn remove_record<K: KvWrite + ?Sized>(kv: &mut K, ns: &str, name: &str) -> Result<bool> {
    Ok(kv::delete_bucket(kv, &schema::image(ns, name))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbOptions;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, ImageStore) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("meta.redb"), DbOptions::default()).unwrap();
        (dir, ImageStore::new(Arc::new(db)))
    }

    fn ctx() -> Context<'static> {
        Context::with_namespace_only("default")
    }

    fn target(data: &str) -> Descriptor {
        let mut d = Descriptor::new(
            "application/vnd.oci.image.index.v1+json",
            Digest::from_bytes(data.as_bytes()),
            data.len() as i64,
        );
        d.platform = Some(Platform {
            os: "linux".into(),
            architecture: "amd64".into(),
            variant: String::new(),
        });
        d
    }

    #[test]
    fn test_create_get_round_trip() {
        let (_dir, is) = open();
        let mut image = Image::new("docker.io/library/alpine:latest", target("index"))
            .with_labels(labels::from_pairs([("a", "1")]));
        image.target.annotations.insert("org.opencontainers.image.ref.name".into(), "latest".into());

        let created = is.create(&ctx(), image.clone()).unwrap();
        assert_eq!(created.target, image.target);
        assert_eq!(is.get(&ctx(), &image.name).unwrap(), created);
        assert!(is.create(&ctx(), image).unwrap_err().is_already_exists());
    }

    #[test]
    fn test_validation() {
        let (_dir, is) = open();
        let err = is.create(&ctx(), Image::new("", target("x"))).unwrap_err();
        assert!(err.is_invalid_argument());

        let mut bad = Image::new("img", target("x"));
        bad.target.media_type.clear();
        assert!(is.create(&ctx(), bad).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_update_field_paths() {
        let (_dir, is) = open();
        let mut image =
            Image::new("img", target("one")).with_labels(labels::from_pairs([("a", "1"), ("b", "2")]));
        image.target.annotations.insert("x".into(), "1".into());
        is.create(&ctx(), image.clone()).unwrap();

        let mut change = Image::new("img", target("two")).with_labels(labels::from_pairs([("b", "3")]));
        change.target.annotations.insert("y".into(), "2".into());

        let updated = is.update(&ctx(), &change, &["labels.b", "annotations.y"]).unwrap();
        assert_eq!(updated.labels, labels::from_pairs([("a", "1"), ("b", "3")]));
        assert_eq!(updated.target.digest, image.target.digest);
        assert_eq!(
            updated.target.annotations,
            labels::from_pairs([("x", "1"), ("y", "2")])
        );

        let updated = is.update(&ctx(), &change, &["target"]).unwrap();
        assert_eq!(updated.target, change.target);
        assert_eq!(is.get(&ctx(), "img").unwrap(), updated);

        let updated = is.update(&ctx(), &change, &[]).unwrap();
        assert_eq!(updated.labels, change.labels);

        assert!(is.update(&ctx(), &change, &["name"]).unwrap_err().is_invalid_argument());
        let missing = Image::new("nope", target("x"));
        assert!(is.update(&ctx(), &missing, &[]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, is) = open();
        for name in ["b", "a", "c"] {
            is.create(&ctx(), Image::new(name, target(name))).unwrap();
        }
        let names: Vec<_> = is.list(&ctx(), &[]).unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(is.list(&ctx(), &["name==b"]).unwrap().len(), 1);

        is.delete(&ctx(), "b").unwrap();
        assert!(is.get(&ctx(), "b").unwrap_err().is_not_found());
        assert!(is.delete(&ctx(), "b").unwrap_err().is_not_found());
        assert_eq!(is.db.dirty(), 1);
    }
}
