use std::convert::TryFrom;
use std::env;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use pagemark_core::{
    document_id_for_path, DocumentBackend, DocumentId, DocumentInfo, DocumentMetadata,
    DocumentProvider, RenderImage, RenderRequest,
};
use tracing::{debug, instrument, warn};

/// Explicit location of the Pdfium shared library, checked before `./` and
/// the system library path.
pub const PDFIUM_LIBRARY_ENV: &str = "PAGEMARK_PDFIUM_LIBRARY_PATH";

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let (id, absolute) = document_location(path)?;
        let info = build_document_info(&self.pdfium, id, &absolute)?;
        debug!(document = %info.id, pages = info.page_count, "pdf opened");
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    info: DocumentInfo,
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            pdfium,
            path,
            info,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`.
        // It is stored in `self.document`, which is declared before `pdfium`
        // and therefore dropped first.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            *guard = Some(self.open_document()?);
        }
        match guard.as_ref() {
            Some(document) => f(document),
            None => Err(anyhow!("{:?} is not loaded", self.path)),
        }
    }

    fn render_internal(
        &self,
        document: &PdfDocument<'_>,
        request: &RenderRequest,
    ) -> Result<RenderImage> {
        let page_index: PdfPageIndex = request
            .page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", request.page_index))?;
        let page = document
            .pages()
            .get(page_index)
            .with_context(|| format!("page {} out of range", request.page_index))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page_index))?;
        let pixels = bitmap.as_image().to_rgba8().into_raw();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels,
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self), fields(document = %self.info.id))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.with_document(|document| self.render_internal(document, &request))
    }
}

/// The id comes from the name the user opened, even through a symlink; the
/// resolved path is only used to read the file.
fn document_location(path: &Path) -> Result<(DocumentId, PathBuf)> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", path))?;
    Ok((document_id_for_path(path), absolute))
}

fn build_document_info(pdfium: &Pdfium, id: DocumentId, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let tag = |kind: PdfDocumentMetadataTagType| metadata.get(kind).map(|t| t.value().to_owned());
    let keywords = tag(PdfDocumentMetadataTagType::Keywords)
        .map(|raw| split_keywords(&raw))
        .unwrap_or_default();

    Ok(DocumentInfo {
        id,
        path: path.to_path_buf(),
        page_count,
        metadata: DocumentMetadata {
            title: tag(PdfDocumentMetadataTagType::Title),
            author: tag(PdfDocumentMetadataTagType::Author),
            keywords,
        },
    })
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
        .collect()
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = env::var(PDFIUM_LIBRARY_ENV).ok().filter(|p| !p.is_empty())?;
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!("failed to load Pdfium from {}={}: {}", PDFIUM_LIBRARY_ENV, path, err);
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; install it or set {} ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_split_on_commas_and_semicolons() {
        assert_eq!(
            split_keywords("pdf, annotation;  reader ,,"),
            vec!["pdf", "annotation", "reader"]
        );
        assert!(split_keywords("  ").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_documents_keep_the_opened_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("abc123.pdf");
        std::fs::write(&target, b"%PDF-1.4").unwrap();
        let link = dir.path().join("paper.pdf");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let (id, absolute) = document_location(&link).unwrap();
        assert_eq!(id, "paper.pdf");
        assert_eq!(id, document_id_for_path(&link));
        assert_eq!(absolute, target.canonicalize().unwrap());
    }

    #[test]
    fn missing_documents_fail_to_resolve() {
        assert!(document_location(Path::new("/nonexistent/paper.pdf")).is_err());
    }
}
