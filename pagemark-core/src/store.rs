//! Authoritative annotation storage for one document.
//!
//! The store keeps the in-memory [`DocumentAnnotations`] and is the only
//! writer to the backend. Writes go through a single background task so they
//! land in order; queued writes coalesce and the newest document wins.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::error::AnnotationError;
use crate::object::{DocumentAnnotations, PageSnapshot};
use crate::{DocumentId, PageNumber};

#[async_trait]
pub trait AnnotationBackend: Send + Sync {
    /// `Ok(None)` when nothing was ever stored for `id`. Data that exists but
    /// does not decode is reported as [`AnnotationError::CorruptStore`].
    async fn fetch(&self, id: &str) -> Result<Option<DocumentAnnotations>>;
    async fn store(&self, id: &str, annotations: &DocumentAnnotations) -> Result<()>;
    /// Returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool>;
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One pretty-printed JSON file per document.
pub struct FileAnnotationBackend {
    root: PathBuf,
}

impl FileAnnotationBackend {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create annotation directory at {:?}", root))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(id)))
    }
}

#[async_trait]
impl AnnotationBackend for FileAnnotationBackend {
    async fn fetch(&self, id: &str) -> Result<Option<DocumentAnnotations>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read annotation file {:?}", path))?;
        Ok(Some(decode(&raw, &path.display().to_string())?))
    }

    async fn store(&self, id: &str, annotations: &DocumentAnnotations) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(annotations)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp annotation file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move annotations into place at {:?}", path))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("failed to remove {:?}", path))?;
        Ok(true)
    }
}

/// In-process backend. Counts writes and can be told to fail.
#[derive(Default)]
pub struct MemoryAnnotationBackend {
    inner: Mutex<HashMap<String, DocumentAnnotations>>,
    writes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryAnnotationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<DocumentAnnotations> {
        self.inner.lock().get(id).cloned()
    }

    pub fn insert(&self, id: &str, annotations: DocumentAnnotations) {
        self.inner.lock().insert(id.to_string(), annotations);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("annotation backend is offline");
        }
        Ok(())
    }
}

#[async_trait]
impl AnnotationBackend for MemoryAnnotationBackend {
    async fn fetch(&self, id: &str) -> Result<Option<DocumentAnnotations>> {
        self.check_online()?;
        Ok(self.get(id))
    }

    async fn store(&self, id: &str, annotations: &DocumentAnnotations) -> Result<()> {
        self.check_online()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(id, annotations.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.inner.lock().remove(id).is_some())
    }
}

fn decode(raw: &str, location: &str) -> Result<DocumentAnnotations, AnnotationError> {
    serde_json::from_str(raw).map_err(|err| AnnotationError::CorruptStore {
        location: location.to_string(),
        reason: err.to_string(),
    })
}

fn is_corrupt(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AnnotationError>(),
        Some(AnnotationError::CorruptStore { .. })
    )
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    filename: &'a str,
    data: &'a DocumentAnnotations,
}

/// Remote annotation service speaking the `/api/annotations` protocol.
pub struct HttpAnnotationBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpAnnotationBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid server url {base_url:?}"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(["api", "annotations"])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl AnnotationBackend for HttpAnnotationBackend {
    async fn fetch(&self, id: &str) -> Result<Option<DocumentAnnotations>> {
        let url = self.endpoint(&[id])?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("GET {url} returned {}", response.status());
        }
        let raw = response
            .text()
            .await
            .with_context(|| format!("failed to read annotations from {url}"))?;
        Ok(Some(decode(&raw, url.as_str())?))
    }

    async fn store(&self, id: &str, annotations: &DocumentAnnotations) -> Result<()> {
        let url = self.endpoint(&["save"])?;
        let body = SaveRequest {
            filename: id,
            data: annotations,
        };
        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !response.status().is_success() {
            bail!("POST {url} returned {}", response.status());
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let url = self.endpoint(&[id])?;
        let response = self
            .http
            .delete(url.clone())
            .send()
            .await
            .with_context(|| format!("DELETE {url}"))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => bail!("DELETE {url} returned {status}"),
        }
    }
}

/// Outcome of the most recent write, as seen by a flush barrier.
type WriteOutcome = Result<(), String>;

enum WriteOp {
    Save(DocumentAnnotations),
    Flush(oneshot::Sender<WriteOutcome>),
}

fn spawn_writer(
    backend: Arc<dyn AnnotationBackend>,
    id: DocumentId,
) -> mpsc::UnboundedSender<WriteOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();

    tokio::spawn(async move {
        let mut last: WriteOutcome = Ok(());
        while let Some(op) = rx.recv().await {
            let mut latest = None;
            let mut barriers = Vec::new();
            let mut queued = 0usize;
            let mut take = |op: WriteOp| match op {
                WriteOp::Save(doc) => {
                    queued += 1;
                    latest = Some(doc);
                }
                WriteOp::Flush(done) => barriers.push(done),
            };
            take(op);
            while let Ok(next) = rx.try_recv() {
                take(next);
            }

            if let Some(doc) = latest {
                debug!(document = %id, coalesced = queued, "writing annotations");
                last = match backend.store(&id, &doc).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(document = %id, error = %err, "failed to save annotations");
                        Err(format!("{err:#}"))
                    }
                };
            }
            for done in barriers {
                let _ = done.send(last.clone());
            }
        }
        debug!(document = %id, "annotation writer stopped");
    });

    tx
}

/// Pretty JSON ready to be written to `file_name`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationExport {
    pub file_name: String,
    pub contents: String,
}

pub struct AnnotationStore {
    id: DocumentId,
    backend: Arc<dyn AnnotationBackend>,
    annotations: DocumentAnnotations,
    writer: mpsc::UnboundedSender<WriteOp>,
    /// Set when the stored copy exists but could not be decoded.
    read_only: bool,
}

impl AnnotationStore {
    /// Must be called from within a tokio runtime.
    pub fn new(id: DocumentId, backend: Arc<dyn AnnotationBackend>) -> Self {
        let writer = spawn_writer(Arc::clone(&backend), id.clone());
        Self {
            id,
            backend,
            annotations: DocumentAnnotations::default(),
            writer,
            read_only: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn annotations(&self) -> &DocumentAnnotations {
        &self.annotations
    }

    pub fn page(&self, page: PageNumber) -> Option<&PageSnapshot> {
        self.annotations.page(page)
    }

    /// Whether saves are being withheld because the stored copy could not be
    /// decoded. Writing would replace pages this session never saw.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Replaces the in-memory copy with the backend's. Missing or unreachable
    /// data yields an empty document; undecodable data also makes the store
    /// read-only.
    #[instrument(skip(self), fields(document = %self.id))]
    pub async fn load(&mut self) -> &DocumentAnnotations {
        self.annotations = match self.backend.fetch(&self.id).await {
            Ok(Some(annotations)) => {
                debug!(pages = annotations.pages.len(), "annotations loaded");
                annotations
            }
            Ok(None) => {
                debug!("no stored annotations");
                DocumentAnnotations::default()
            }
            Err(err) if is_corrupt(&err) => {
                error!(error = %err, "stored annotations are unreadable; saving disabled");
                self.read_only = true;
                DocumentAnnotations::default()
            }
            Err(err) => {
                warn!(error = %err, "failed to load annotations; starting empty");
                DocumentAnnotations::default()
            }
        };
        &self.annotations
    }

    pub fn record_page(&mut self, page: PageNumber, snapshot: PageSnapshot) {
        self.annotations.set_page(page, snapshot);
    }

    /// Queues the whole document for writing. Never blocks.
    pub fn save(&self) {
        if self.read_only {
            debug!(document = %self.id, "store is read-only; save skipped");
            return;
        }
        if self
            .writer
            .send(WriteOp::Save(self.annotations.clone()))
            .is_err()
        {
            warn!(document = %self.id, "annotation writer is gone; dropping save");
        }
    }

    /// Resolves once every save queued before this call has been attempted.
    pub async fn flush(&self) {
        let _ = self.barrier().await;
    }

    /// Writes the current document and waits for the result.
    pub async fn save_now(&self) -> Result<(), AnnotationError> {
        if self.read_only {
            return Err(AnnotationError::Transport(anyhow!(
                "stored annotations for {} are unreadable; refusing to overwrite",
                self.id
            )));
        }
        self.save();
        self.barrier()
            .await
            .map_err(|reason| AnnotationError::Transport(anyhow!(reason)))
    }

    async fn barrier(&self) -> WriteOutcome {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriteOp::Flush(done)).is_err() {
            return Err("annotation writer is gone".to_string());
        }
        wait.await
            .unwrap_or_else(|_| Err("annotation writer is gone".to_string()))
    }

    /// Flushes, then adopts the backend's copy. The in-memory copy is kept
    /// when the backend is unreachable or has nothing, since the writes it
    /// would have held were just attempted.
    #[instrument(skip(self), fields(document = %self.id))]
    pub async fn reconcile(&mut self) -> &DocumentAnnotations {
        self.flush().await;
        match self.backend.fetch(&self.id).await {
            Ok(Some(annotations)) => {
                self.annotations = annotations;
                self.read_only = false;
            }
            Ok(None) => debug!("backend has no annotations; keeping local copy"),
            Err(err) => warn!(error = %err, "failed to reload annotations; keeping local copy"),
        }
        &self.annotations
    }

    pub fn export_file_name(&self) -> String {
        format!("{}_annotations.json", self.id)
    }

    pub fn export_json(&self) -> Result<AnnotationExport> {
        let contents = serde_json::to_string_pretty(&self.annotations)
            .context("failed to serialize annotations")?;
        Ok(AnnotationExport {
            file_name: self.export_file_name(),
            contents,
        })
    }

    /// Replaces the authoritative copy with an imported file and persists it.
    /// Returns the number of imported pages, or the write failure.
    ///
    /// An import replaces every page, so it may overwrite a stored copy that
    /// could not be decoded.
    pub async fn import_json(&mut self, text: &str) -> Result<usize, AnnotationError> {
        let imported = DocumentAnnotations::from_import(text)?;
        let pages = imported.pages.len();
        self.annotations = imported;
        self.read_only = false;
        self.save_now().await?;
        info!(document = %self.id, pages, "annotations imported");
        Ok(pages)
    }

    /// Deletes the stored annotations and clears the in-memory copy.
    pub async fn purge(&mut self) -> Result<bool, AnnotationError> {
        self.flush().await;
        self.annotations = DocumentAnnotations::default();
        self.read_only = false;
        self.backend
            .remove(&self.id)
            .await
            .map_err(AnnotationError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AnnotationObject;
    use crate::geometry::Point;
    use crate::style::BrushStyle;
    use tempfile::tempdir;

    fn snapshot_with_stroke() -> PageSnapshot {
        let style = BrushStyle {
            color: "#000000".into(),
            width: 2.0,
        };
        PageSnapshot {
            objects: vec![AnnotationObject::stroke(
                vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)],
                &style,
            )],
            ..PageSnapshot::default()
        }
    }

    #[test]
    fn ids_are_sanitized_for_file_names() {
        assert_eq!(sanitize_id("My Paper (v2).pdf"), "My_Paper__v2_.pdf");
        assert_eq!(sanitize_id("../etc/passwd"), ".._etc_passwd");
    }

    #[tokio::test]
    async fn file_backend_round_trips_documents() {
        let dir = tempdir().unwrap();
        let backend = FileAnnotationBackend::new(dir.path().join("annotations")).unwrap();
        assert!(backend.fetch("paper.pdf").await.unwrap().is_none());

        let mut doc = DocumentAnnotations::default();
        doc.set_page(2, snapshot_with_stroke());
        backend.store("paper.pdf", &doc).await.unwrap();
        assert!(backend.path_for("paper.pdf").exists());
        assert_eq!(backend.fetch("paper.pdf").await.unwrap(), Some(doc));

        assert!(backend.remove("paper.pdf").await.unwrap());
        assert!(!backend.remove("paper.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn queued_saves_coalesce_and_last_write_wins() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        store.load().await;

        for page in 1..=3 {
            store.record_page(page, snapshot_with_stroke());
            store.save();
        }
        store.flush().await;

        assert_eq!(backend.writes(), 1);
        let stored = backend.get("doc.pdf").unwrap();
        assert_eq!(stored.pages.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn transport_errors_degrade_to_empty() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut seeded = DocumentAnnotations::default();
        seeded.set_page(1, snapshot_with_stroke());
        backend.insert("doc.pdf", seeded);
        backend.set_offline(true);

        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        assert!(store.load().await.pages.is_empty());

        store.record_page(4, snapshot_with_stroke());
        store.save();
        store.flush().await;
        assert_eq!(backend.writes(), 0);

        backend.set_offline(false);
        store.save();
        store.flush().await;
        assert_eq!(backend.writes(), 1);
    }

    #[tokio::test]
    async fn reconcile_adopts_backend_copy_but_survives_outage() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        store.record_page(1, snapshot_with_stroke());
        store.save();
        assert_eq!(store.reconcile().await.object_count(), 1);

        let mut other = DocumentAnnotations::default();
        other.set_page(2, snapshot_with_stroke());
        other.set_page(3, snapshot_with_stroke());
        backend.insert("doc.pdf", other);
        assert_eq!(store.reconcile().await.pages.len(), 2);

        backend.set_offline(true);
        assert_eq!(store.reconcile().await.pages.len(), 2);
    }

    #[tokio::test]
    async fn import_replaces_and_persists_immediately() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        store.record_page(9, snapshot_with_stroke());

        let pages = store
            .import_json(r#"{"1": {"objects": []}, "2": {"objects": []}}"#)
            .await
            .unwrap();
        assert_eq!(pages, 2);
        assert!(store.page(9).is_none());
        assert_eq!(backend.get("doc.pdf").unwrap().pages.len(), 2);
    }

    #[tokio::test]
    async fn import_reports_failed_write() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        backend.set_offline(true);
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());

        let err = store
            .import_json(r#"{"1": {"objects": []}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::Transport(_)));
        assert_eq!(backend.writes(), 0);

        backend.set_offline(false);
        assert_eq!(store.import_json(r#"{"1": {"objects": []}}"#).await.unwrap(), 1);
        assert_eq!(backend.writes(), 1);
    }

    #[tokio::test]
    async fn unknown_object_types_survive_load_and_save() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileAnnotationBackend::new(dir.path().to_path_buf()).unwrap());
        fs::write(
            backend.path_for("doc.pdf"),
            r##"{"pages": {
                "1": {"objects": [{"type": "circle", "left": 5, "top": 5, "radius": 20}]},
                "2": {"objects": [{"type": "path", "points": [{"x": 0, "y": 0}, {"x": 5, "y": 5}],
                                   "stroke": "#000000", "strokeWidth": 2}]}
            }}"##,
        )
        .unwrap();

        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        assert_eq!(store.load().await.pages.len(), 2);
        assert!(!store.is_read_only());
        store.record_page(3, snapshot_with_stroke());
        store.save();
        store.flush().await;

        let stored = backend.fetch("doc.pdf").await.unwrap().unwrap();
        assert_eq!(stored.pages.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        let circle = &stored.page(1).unwrap().objects[0];
        assert_eq!(circle.kind.as_str(), "circle");
        assert_eq!(circle.extra.get("radius"), Some(&serde_json::json!(20)));
    }

    #[tokio::test]
    async fn undecodable_store_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileAnnotationBackend::new(dir.path().to_path_buf()).unwrap());
        let path = backend.path_for("doc.pdf");
        let original = r#"{"pages": {"1": {"objects": [{"left": 5}]}}}"#;
        fs::write(&path, original).unwrap();

        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        assert!(store.load().await.pages.is_empty());
        assert!(store.is_read_only());

        store.record_page(2, snapshot_with_stroke());
        store.save();
        store.flush().await;
        assert!(store.save_now().await.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn malformed_import_changes_nothing() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        store.record_page(1, snapshot_with_stroke());

        let err = store.import_json("{ not json").await.unwrap_err();
        assert!(matches!(err, AnnotationError::MalformedImport { .. }));
        assert_eq!(store.annotations().object_count(), 1);
        assert_eq!(backend.writes(), 0);
    }

    #[tokio::test]
    async fn export_uses_document_name() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("thesis.pdf".into(), backend);
        store.record_page(3, snapshot_with_stroke());
        let export = store.export_json().unwrap();
        assert_eq!(export.file_name, "thesis.pdf_annotations.json");
        let parsed = DocumentAnnotations::from_import(&export.contents).unwrap();
        assert_eq!(parsed.object_count(), 1);
    }

    #[tokio::test]
    async fn purge_removes_stored_copy() {
        let backend = Arc::new(MemoryAnnotationBackend::new());
        let mut store = AnnotationStore::new("doc.pdf".into(), backend.clone());
        store.record_page(1, snapshot_with_stroke());
        store.save();
        assert!(store.purge().await.unwrap());
        assert!(backend.get("doc.pdf").is_none());
        assert!(store.annotations().pages.is_empty());
    }

    #[test]
    fn http_endpoints_escape_document_names() {
        let backend =
            HttpAnnotationBackend::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            backend.endpoint(&["my paper.pdf"]).unwrap().as_str(),
            "http://localhost:8000/api/annotations/my%20paper.pdf"
        );
        assert_eq!(
            backend.endpoint(&["save"]).unwrap().as_str(),
            "http://localhost:8000/api/annotations/save"
        );
    }
}
