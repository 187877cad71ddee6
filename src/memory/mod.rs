//! 记忆层：对话消息、字段目录缓存、查询产物

pub mod artifacts;
pub mod conversation;
pub mod metadata_cache;
pub mod normalize;

pub use artifacts::{row_count, shape_summary, truncate_chars, unwrap_text_payload, ArtifactStore, SavedArtifact};
pub use conversation::{Message, Role};
pub use metadata_cache::{CacheOrigin, CachedFields, MetadataCache};
pub use normalize::{normalize_aggregation, normalize_fields, NormalizedField};
