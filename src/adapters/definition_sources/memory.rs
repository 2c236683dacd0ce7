use std::sync::{
    Mutex,
    atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::{config::definition::Definition, ports::definition_source::DefinitionSource};

/// In-process definition source.
///
/// Every [`MemoryDefinitionSource::set_definition`] stamps the definition with
/// the next version and signals watchers. Used by embedders that build their
/// routes programmatically, and by tests.
pub struct MemoryDefinitionSource {
    current: Mutex<Definition>,
    next_version: AtomicI64,
    update_tx: mpsc::Sender<()>,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MemoryDefinitionSource {
    pub fn new(definition: Definition) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let version = definition.version.max(1);
        Self {
            current: Mutex::new(definition.with_version(version)),
            next_version: AtomicI64::new(version + 1),
            update_tx: tx,
            update_rx: Mutex::new(Some(rx)),
        }
    }

    /// Replace the definition and notify watchers. Returns the new version.
    pub fn set_definition(&self, definition: Definition) -> i64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        match self.current.lock() {
            Ok(mut current) => *current = definition.with_version(version),
            Err(poisoned) => *poisoned.into_inner() = definition.with_version(version),
        }
        // A pending signal already covers this change.
        let _ = self.update_tx.try_send(());
        version
    }
}

#[async_trait]
impl DefinitionSource for MemoryDefinitionSource {
    async fn load_definition(&self) -> Result<Definition> {
        let current = self
            .current
            .lock()
            .map_err(|_| eyre::eyre!("Definition lock poisoned"))?;
        Ok(current.clone())
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx.lock().ok()?.take()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
