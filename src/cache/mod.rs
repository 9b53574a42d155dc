mod mapping_cache;

pub use mapping_cache::{cache_key, CacheMirror, MappingCache};
