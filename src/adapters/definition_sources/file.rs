use std::{
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{definition::Definition, loader::load_definition},
    ports::definition_source::DefinitionSource,
};

/// Definition source backed by a local file, watched for changes.
///
/// The version of a loaded definition is the file's modification time in
/// nanoseconds since the epoch, so an edit always produces a newer version.
pub struct FileDefinitionSource {
    path: PathBuf,
    // Dropping the watcher stops notifications.
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileDefinitionSource {
    /// Source that loads on demand and never signals changes.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            path: path.into(),
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Source that also watches the file's directory.
    pub fn watched(path: impl Into<PathBuf>) -> Result<Self> {
        let mut source = Self::new(path);
        source.init_watcher()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid definition path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&file_name))
                        {
                            tracing::debug!("Definition file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        // Watch the directory so editors that replace the file are seen.
        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch definition directory")?;

        tracing::info!(path = %self.path.display(), "Watching definition file");
        self._watcher = Some(watcher);
        Ok(())
    }

    fn modified_version(&self) -> Result<i64> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("Failed to stat {}", self.path.display()))?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .wrap_err("Definition file modified before the epoch")?
            .as_nanos();
        Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl DefinitionSource for FileDefinitionSource {
    async fn load_definition(&self) -> Result<Definition> {
        let version = self.modified_version()?;
        let definition = load_definition(&self.path)?;
        Ok(definition.with_version(version))
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self._watcher.as_ref()?;
        self.update_rx.lock().ok()?.take()
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
