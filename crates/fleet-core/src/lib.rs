pub mod catalog;
pub mod locks;
pub mod manifest;

pub use catalog::AppCatalog;
pub use locks::MutexManager;
pub use manifest::*;
