use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::definition::Definition;

/// Supplies route definitions and signals when they change.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Load the current definition, stamped with its version.
    async fn load_definition(&self) -> Result<Definition>;

    /// Return a channel that signals when the definition has changed.
    /// The receiver should trigger a reload by calling `load_definition`.
    ///
    /// The receiver can be taken once; later calls return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;

    /// Human readable location, used in logs.
    fn describe(&self) -> String;
}
