use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub mod config;
pub mod error;
pub mod geometry;
pub mod mode;
pub mod object;
pub mod pool;
pub mod reader;
pub mod store;
pub mod style;
pub mod surface;

pub use config::ReaderConfig;
pub use error::AnnotationError;
pub use geometry::{PageDimensions, Point, SurfaceGeometry, Transform, ViewportState, ZoomLimits};
pub use mode::{AnnotationMode, Cursor, InteractionPolicy, ModeController, ModeState};
pub use object::{AnnotationObject, DocumentAnnotations, ObjectKind, PageSnapshot};
pub use pool::{FormFactor, PageLayout, PagePool, RenderTicket, ScrollViewport, Topology};
pub use reader::{Command, Reader, ReaderEvent, ReaderOptions};
pub use store::{
    AnnotationBackend, AnnotationStore, FileAnnotationBackend, HttpAnnotationBackend,
    MemoryAnnotationBackend,
};
pub use style::{BrushSettings, Color};
pub use surface::{AnnotationSurface, Propagation, SurfaceContext};

/// 1-based page number.
pub type PageNumber = u32;

/// Annotations are keyed by the document's display file name.
pub type DocumentId = String;

pub fn document_id_for_path(path: &Path) -> DocumentId {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    /// 0-based, as renderers count.
    pub page_index: usize,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
        }
    }
}

/// RGBA8 page bitmap.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    pub fn dimensions(&self) -> PageDimensions {
        PageDimensions::new(self.width, self.height)
    }
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

/// An open document plus a small cache of rendered pages around the one in
/// view.
pub struct DocumentInstance {
    pub info: DocumentInfo,
    pub backend: Arc<dyn DocumentBackend>,
    render_cache: Mutex<HashMap<CacheKey, RenderImage>>,
}

impl DocumentInstance {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            info: backend.info().clone(),
            backend,
            render_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_count(&self) -> u32 {
        u32::try_from(self.info.page_count).unwrap_or(u32::MAX)
    }

    #[instrument(skip(self), fields(document = %self.info.id))]
    pub fn render(&self, page: PageNumber, scale: f64) -> Result<RenderImage> {
        self.render_internal(page, scale, page)
    }

    /// Warms the cache for `range` pages on both sides of `page`. Returns the
    /// last failure, if any, after trying all of them.
    pub fn prefetch_neighbors(&self, page: PageNumber, range: u32, scale: f64) -> Result<()> {
        let mut last_error: Option<Error> = None;
        for offset in 1..=range {
            let around = [page.checked_sub(offset), page.checked_add(offset)];
            for neighbor in around.into_iter().flatten() {
                if neighbor == 0 || neighbor > self.page_count() {
                    continue;
                }
                if let Err(err) = self.render_internal(neighbor, scale, page) {
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn render_internal(
        &self,
        page: PageNumber,
        scale: f64,
        reference_page: PageNumber,
    ) -> Result<RenderImage> {
        if page == 0 || page > self.page_count() {
            return Err(anyhow!("page {} out of range", page));
        }

        let key = CacheKey::new(page, scale);
        if let Some(image) = self.render_cache.lock().get(&key).cloned() {
            return Ok(image);
        }

        let request = RenderRequest {
            page_index: (page - 1) as usize,
            scale: scale as f32,
        };
        let image = self.backend.render_page(request)?;
        self.store_cached_render(key, &image, reference_page);
        Ok(image)
    }

    fn store_cached_render(&self, key: CacheKey, image: &RenderImage, reference_page: PageNumber) {
        let mut cache = self.render_cache.lock();
        cache.insert(key, image.clone());

        if cache.len() > CACHE_CAPACITY {
            let mut keys: Vec<_> = cache.keys().cloned().collect();
            keys.sort_by_key(|k| k.distance(reference_page));
            for stale in keys.into_iter().skip(CACHE_CAPACITY) {
                cache.remove(&stale);
            }
        }
    }
}

const CACHE_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    page: PageNumber,
    scale_milli: u32,
}

impl CacheKey {
    fn new(page: PageNumber, scale: f64) -> Self {
        let scaled = (scale * 1000.0).round();
        let scale_milli = if !scaled.is_finite() || scaled <= 0.0 {
            1
        } else {
            scaled.min(f64::from(u32::MAX)) as u32
        };
        Self { page, scale_milli }
    }

    fn distance(&self, reference_page: PageNumber) -> u32 {
        self.page.abs_diff(reference_page)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProvider;
    use super::*;

    #[test]
    fn document_id_is_the_file_name() {
        assert_eq!(
            document_id_for_path(Path::new("/papers/2024/attention.pdf")),
            "attention.pdf"
        );
        assert_eq!(
            document_id_for_path(Path::new("/elsewhere/attention.pdf")),
            document_id_for_path(Path::new("attention.pdf"))
        );
    }

    #[tokio::test]
    async fn render_cache_serves_repeat_requests() {
        let provider = FakeProvider { page_count: 30 };
        let backend = provider.open(Path::new("book.pdf")).await.unwrap();
        let document = DocumentInstance::new(backend);

        let first = document.render(3, 1.5).unwrap();
        assert_eq!(first.dimensions(), PageDimensions::new(900, 1200));
        let again = document.render(3, 1.5).unwrap();
        assert_eq!(again.pixels, first.pixels);
        assert_eq!(document.render_cache.lock().len(), 1);

        assert!(document.render(0, 1.0).is_err());
        assert!(document.render(31, 1.0).is_err());
    }

    #[tokio::test]
    async fn prefetch_keeps_cache_bounded() {
        let provider = FakeProvider { page_count: 30 };
        let backend = provider.open(Path::new("book.pdf")).await.unwrap();
        let document = DocumentInstance::new(backend);

        document.render(15, 1.0).unwrap();
        document.prefetch_neighbors(15, 8, 1.0).unwrap();
        let cache = document.render_cache.lock();
        assert_eq!(cache.len(), CACHE_CAPACITY);
        assert!(cache.contains_key(&CacheKey::new(15, 1.0)));
        assert!(!cache.contains_key(&CacheKey::new(23, 1.0)));
    }
}
