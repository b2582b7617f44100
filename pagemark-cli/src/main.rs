use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use pagemark_core::{
    document_id_for_path, AnnotationBackend, AnnotationStore, DocumentAnnotations,
    FileAnnotationBackend, HttpAnnotationBackend, ObjectKind, ReaderConfig, Topology,
};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

mod view;

#[derive(Debug, Parser)]
#[command(
    name = "pagemark",
    version,
    about = "Annotate PDFs from a kitty-compatible terminal"
)]
struct Args {
    /// Annotation server base URL; annotations are stored locally without one
    #[arg(long, global = true)]
    server: Option<String>,

    /// Directory local annotation files are kept in
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file to read instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Open a PDF and annotate it
    View {
        file: PathBuf,
        /// Page to open on (1-based)
        #[arg(short = 'p', long = "page")]
        page: Option<u32>,
        /// Page layout: continuous or single
        #[arg(long)]
        topology: Option<Topology>,
    },
    /// Write a document's annotations to a JSON file
    Export {
        /// The annotated PDF; only its file name is used
        file: PathBuf,
        /// Target path, `-` for stdout; defaults to `<name>_annotations.json`
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Replace a document's annotations with an exported JSON file
    Import { file: PathBuf, input: PathBuf },
    /// Summarize the stored annotations of a document
    Show { file: PathBuf },
    /// Delete all stored annotations of a document
    Purge { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagemark", "pagemark")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let interactive = matches!(args.command, Cmd::View { .. });
    let _log_guard = init_logging(&project_dirs, !interactive)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| ReaderConfig::path(&project_dirs));
    let mut config = ReaderConfig::load(&config_path)?;
    if let Some(server) = &args.server {
        config.server_url = Some(server.clone());
    }
    debug!(?config_path, ?config, "configuration loaded");

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("annotations"));
    let backend = annotation_backend(&config, data_dir)?;

    match args.command {
        Cmd::View {
            file,
            page,
            topology,
        } => {
            if let Some(topology) = topology {
                config.topology = topology;
            }
            view::run(file, page, &config, backend).await
        }
        Cmd::Export { file, output } => export(&file, output, backend).await,
        Cmd::Import { file, input } => import(&file, &input, backend).await,
        Cmd::Show { file } => show(&file, backend).await,
        Cmd::Purge { file } => purge(&file, backend).await,
    }
}

fn annotation_backend(
    config: &ReaderConfig,
    data_dir: PathBuf,
) -> Result<Arc<dyn AnnotationBackend>> {
    match config.server_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            info!(%url, "using annotation server");
            Ok(Arc::new(HttpAnnotationBackend::new(url, config.http_timeout)?))
        }
        None => {
            debug!(?data_dir, "using local annotation files");
            Ok(Arc::new(FileAnnotationBackend::new(data_dir)?))
        }
    }
}

async fn open_store(file: &Path, backend: Arc<dyn AnnotationBackend>) -> AnnotationStore {
    let mut store = AnnotationStore::new(document_id_for_path(file), backend);
    store.load().await;
    store
}

async fn export(
    file: &Path,
    output: Option<PathBuf>,
    backend: Arc<dyn AnnotationBackend>,
) -> Result<()> {
    let store = open_store(file, backend).await;
    let export = store.export_json()?;
    match output {
        Some(path) if path == Path::new("-") => {
            let mut stdout = io::stdout();
            writeln!(stdout, "{}", export.contents)?;
        }
        other => {
            let path = other.unwrap_or_else(|| PathBuf::from(&export.file_name));
            fs::write(&path, &export.contents)
                .with_context(|| format!("failed to write {:?}", path))?;
            println!(
                "exported {} object(s) to {}",
                store.annotations().object_count(),
                path.display()
            );
        }
    }
    Ok(())
}

async fn import(file: &Path, input: &Path, backend: Arc<dyn AnnotationBackend>) -> Result<()> {
    let text =
        fs::read_to_string(input).with_context(|| format!("failed to read {:?}", input))?;
    let mut store = AnnotationStore::new(document_id_for_path(file), backend);
    let pages = store.import_json(&text).await?;
    println!(
        "imported {} page(s) for {}",
        pages,
        document_id_for_path(file)
    );
    Ok(())
}

async fn show(file: &Path, backend: Arc<dyn AnnotationBackend>) -> Result<()> {
    let store = open_store(file, backend).await;
    let mut stdout = io::stdout();
    write_summary(&mut stdout, store.id(), store.annotations())?;
    Ok(())
}

async fn purge(file: &Path, backend: Arc<dyn AnnotationBackend>) -> Result<()> {
    let mut store = AnnotationStore::new(document_id_for_path(file), backend);
    if store.purge().await? {
        println!("removed annotations for {}", store.id());
    } else {
        println!("no annotations stored for {}", store.id());
    }
    Ok(())
}

fn write_summary(
    writer: &mut impl Write,
    id: &str,
    annotations: &DocumentAnnotations,
) -> io::Result<()> {
    writeln!(
        writer,
        "{}: {} page(s), {} object(s)",
        id,
        annotations.pages.len(),
        annotations.object_count()
    )?;
    for (page, snapshot) in &annotations.pages {
        let count = |kind: ObjectKind| snapshot.objects.iter().filter(|o| o.kind == kind).count();
        let other = snapshot
            .objects
            .iter()
            .filter(|o| matches!(o.kind, ObjectKind::Other(_)))
            .count();
        write!(
            writer,
            "  page {}: {} stroke(s), {} text, {} rect(s)",
            page,
            count(ObjectKind::Path),
            count(ObjectKind::IText),
            count(ObjectKind::Rect)
        )?;
        if other > 0 {
            write!(writer, ", {} other", other)?;
        }
        writeln!(writer)?;
    }
    writer.flush()
}

/// Logs go to a file; the console only gets them outside the viewer, where
/// they would draw over the page.
fn init_logging(project_dirs: &ProjectDirs, console: bool) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagemark.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_filter(EnvFilter::new("warn"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
