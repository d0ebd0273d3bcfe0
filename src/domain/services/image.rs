use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::context::RequestContext;
use crate::domain::utils::id::ImageId;
use crate::domain::utils::strutils::bool_from_string;
use crate::error::{Error, Result};

pub const IMAGE_STATUS_ACTIVE: &str = "active";

/// Image metadata as returned by the image service. Sizes in bytes, `min_*` in MiB/GiB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: Option<ImageId>,
    pub name: Option<String>,
    pub status: String,
    pub min_ram: i64,
    pub min_disk: i64,
    pub size: i64,
    pub properties: Map<String, Value>,
}

impl ImageMeta {
    pub fn active(id: impl Into<String>) -> Self {
        Self { id: Some(ImageId::new(id)), status: IMAGE_STATUS_ACTIVE.to_string(), ..Default::default() }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key).filter(|v| !v.is_null())
    }

    /// Scalar property rendered as a string.
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.property(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn property_bool(&self, key: &str) -> Option<bool> {
        match self.property(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(bool_from_string(s)),
            _ => None,
        }
    }
}

pub trait ImageService: Debug + Send + Sync {
    fn get(&self, ctx: &RequestContext, image_id: &ImageId) -> Result<ImageMeta>;

    /// Registers a new image; an id is assigned when the metadata has none.
    fn create(&self, ctx: &RequestContext, meta: ImageMeta) -> Result<ImageMeta>;

    fn delete(&self, ctx: &RequestContext, image_id: &ImageId) -> Result<()>;
}

/// Image catalog held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryImageService {
    images: Arc<RwLock<HashMap<ImageId, ImageMeta>>>,
}

impl InMemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, meta: ImageMeta) -> ImageId {
        let id = meta.id.clone().unwrap_or_else(ImageId::generate);
        let meta = ImageMeta { id: Some(id.clone()), ..meta };
        self.images.write().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), meta);
        id
    }

    pub fn contains(&self, image_id: &ImageId) -> bool {
        self.images.read().unwrap_or_else(PoisonError::into_inner).contains_key(image_id)
    }

    pub fn all(&self) -> Vec<ImageMeta> {
        self.images.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }
}

impl ImageService for InMemoryImageService {
    fn get(&self, _ctx: &RequestContext, image_id: &ImageId) -> Result<ImageMeta> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Image", image_id))
    }

    fn create(&self, _ctx: &RequestContext, meta: ImageMeta) -> Result<ImageMeta> {
        let id = self.add(meta);
        log::debug!("ImageService: created image {}", id);
        self.images.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned().ok_or_else(|| Error::not_found("Image", &id))
    }

    fn delete(&self, _ctx: &RequestContext, image_id: &ImageId) -> Result<()> {
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Image", image_id))
    }
}
