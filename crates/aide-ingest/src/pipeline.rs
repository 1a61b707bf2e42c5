use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use aide_memory::MemoryStore;

use crate::chunk::{chunk_text, extract_title};
use crate::error::{IngestError, Result};

const SUPPORTED_EXTENSIONS: [&str; 2] = ["txt", "md"];

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Ingestion root, holding `input/<scope>/` and `done/<scope>/`.
    pub root: PathBuf,
    /// Move originals to done/ instead of marker-and-delete.
    pub keep_files: bool,
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_file_bytes: usize,
}

impl IngestSettings {
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(root),
            keep_files: false,
            chunk_size: 500,
            overlap: 50,
            max_file_bytes: 1024 * 1024,
        }
    }

    fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    fn done_dir(&self) -> PathBuf {
        self.root.join("done")
    }
}

/// Scan `input/<scope>/` directories and ingest every pending file.
/// Returns (files_processed, total_chunks). Per-file failures are logged
/// and skipped; the scan always completes.
pub fn process_pending(store: &MemoryStore, settings: &IngestSettings) -> (usize, usize) {
    let input_dir = settings.input_dir();
    let done_dir = settings.done_dir();
    if let Err(e) = std::fs::create_dir_all(&input_dir).and_then(|_| std::fs::create_dir_all(&done_dir)) {
        error!(error = %e, "cannot create ingestion directories");
        return (0, 0);
    }

    let mut files_processed = 0;
    let mut total_chunks = 0;

    let Ok(scope_dirs) = std::fs::read_dir(&input_dir) else {
        return (0, 0);
    };
    for scope_entry in scope_dirs.flatten() {
        let scope_path = scope_entry.path();
        if !scope_path.is_dir() {
            continue;
        }
        let scope = scope_entry.file_name().to_string_lossy().to_string();

        let Ok(files) = std::fs::read_dir(&scope_path) else {
            continue;
        };
        for file_entry in files.flatten() {
            let filepath = file_entry.path();
            if !filepath.is_file() {
                continue;
            }
            let name = file_entry.file_name().to_string_lossy().to_string();

            // Hidden and temp files (atomic-write leftovers) are skipped.
            if name.starts_with('.') {
                continue;
            }
            let supported = filepath
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()));
            if !supported {
                debug!(file = %name, "skipping unsupported extension");
                continue;
            }
            // Already processed in a previous pass.
            if done_dir.join(&scope).join(&name).exists() {
                continue;
            }

            match ingest_file(&filepath, store, &scope, settings) {
                Ok(chunks) if chunks > 0 => {
                    if let Err(e) = mark_done(&filepath, &scope, &done_dir, settings.keep_files) {
                        warn!(file = %name, error = %e, "mark-done failed");
                    }
                    files_processed += 1;
                    total_chunks += chunks;
                }
                Ok(_) => {
                    // Empty file: nothing indexed, remove so it is not rescanned.
                    let _ = std::fs::remove_file(&filepath);
                }
                Err(IngestError::NotUtf8) | Err(IngestError::TooLarge { .. }) => {
                    warn!(file = %name, scope = %scope, "rejecting bad file");
                    let _ = std::fs::remove_file(&filepath);
                }
                Err(e) => error!(file = %name, error = %e, "ingestion failed"),
            }
        }
    }

    if files_processed > 0 {
        info!(files_processed, total_chunks, "ingestion pass complete");
    }
    (files_processed, total_chunks)
}

/// Ingest a single file under a scope. Prior chunks of the same
/// `(scope, source)` are replaced. Returns the chunk count.
pub fn ingest_file(
    filepath: &Path,
    store: &MemoryStore,
    scope: &str,
    settings: &IngestSettings,
) -> Result<usize> {
    let bytes = std::fs::read(filepath)?;
    if bytes.len() > settings.max_file_bytes {
        return Err(IngestError::TooLarge {
            size: bytes.len(),
            max: settings.max_file_bytes,
        });
    }
    let text = String::from_utf8(bytes).map_err(|_| IngestError::NotUtf8)?;
    if text.trim().is_empty() {
        warn!(file = %filepath.display(), "skipping empty file");
        return Ok(0);
    }

    let filename = filepath
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    let source = format!("{scope}/{filename}");
    let title = extract_title(&text, &original_filename(filename));

    store.delete_knowledge_source(scope, &source)?;

    let chunks = chunk_text(&text, settings.chunk_size, settings.overlap);
    for (index, content) in chunks.iter().enumerate() {
        store.store_knowledge_chunk(scope, &source, &title, content, index as i64)?;
    }

    info!(file = %filename, scope, chunks = chunks.len(), "file ingested");
    Ok(chunks.len())
}

fn mark_done(filepath: &Path, scope: &str, done_dir: &Path, keep_files: bool) -> Result<()> {
    let scope_done = done_dir.join(scope);
    std::fs::create_dir_all(&scope_done)?;
    let dest = scope_done.join(filepath.file_name().unwrap_or_default());

    if keep_files {
        std::fs::rename(filepath, &dest)?;
        debug!(dest = %dest.display(), "moved ingested file to done");
    } else {
        std::fs::write(&dest, b"")?;
        std::fs::remove_file(filepath)?;
        debug!(dest = %dest.display(), "marked done, original deleted");
    }
    Ok(())
}

/// Write an attachment into `input/<scope>/` atomically: temp file with a
/// random suffix, then rename into place. The stored name is prefixed with
/// the receive timestamp to keep re-sent files distinct.
pub fn write_attachment(
    settings: &IngestSettings,
    scope: &str,
    filename: &str,
    bytes: &[u8],
    now_ms: i64,
) -> Result<PathBuf> {
    let safe_name = sanitize_filename(filename);
    let scope_dir = settings.input_dir().join(scope);
    std::fs::create_dir_all(&scope_dir)?;

    let final_path = scope_dir.join(format!("{now_ms}_{safe_name}"));
    let tmp_path = scope_dir.join(format!(
        ".{}_{}.tmp",
        uuid::Uuid::new_v4().simple(),
        safe_name
    ));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, &final_path)?;
    info!(path = %final_path.display(), bytes = bytes.len(), "attachment staged for ingestion");
    Ok(final_path)
}

/// Strip any path components and keep a conservative character set.
fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Stored names carry a `{timestamp}_` prefix; recover the original for
/// title extraction.
fn original_filename(stored: &str) -> String {
    if let Some((prefix, rest)) = stored.split_once('_') {
        if !rest.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
            return rest.to_string();
        }
    }
    stored.to_string()
}
