//! maskwork-storage: in-memory session and dataset state
//!
//! Both stores guard their map with a single lock held only for map
//! operations; decoding, thumbnailing and mask encoding happen outside it.

pub mod dataset;
pub mod repository;
pub mod session;

pub use dataset::{DatasetImage, DatasetStore, ImageIndexEntry, IngestArchive, IngestFile};
pub use repository::{DatasetRecord, DatasetRepository, ImageRecord, InMemoryRepository, TemplateRecord};
pub use session::{SessionSnapshot, SessionStore};
