/// Application name, used for platform directories.
pub const APP_NAME: &str = "kiln";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Environment variable overriding the output directory.
pub const OUTPUT_DIR_ENV: &str = "KILN_OUTPUT_DIR";

/// Environment variable overriding the worker count.
pub const PARALLELISM_ENV: &str = "KILN_PARALLELISM";

/// Version of the fingerprint payload. Bumping it invalidates every cache entry.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Version of the on-disk cache entry format.
pub const CACHE_ENTRY_VERSION: u32 = 1;

/// Length of a fingerprint or content hash in hex characters.
pub const HASH_HEX_LEN: usize = 64;
