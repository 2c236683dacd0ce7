pub mod file;
pub mod memory;

pub use file::FileDefinitionSource;
pub use memory::MemoryDefinitionSource;
