pub mod derivative_cache;
pub mod hash;
pub mod key;
pub mod store;

pub use derivative_cache::DerivativeCache;
pub use hash::compute_hash;
pub use key::{
    CropMode, DerivativeKey, Gravity, ParsedDerivative, TransformOptions, parse_derivative_key,
    source_identity,
};
pub use store::{CacheStore, FileCacheStore, MemoryCacheStore};
