//! Loader configuration with environment overrides.

use once_cell::sync::Lazy;

/// Default number of worker threads.
const DEFAULT_WORKERS: usize = 2;

/// Maximum number of worker threads.
const MAX_WORKERS: usize = 8;

/// Default edge length of a scaled chunk, in destination pixels.
const DEFAULT_CHUNK_SIZE: u32 = 256;
const MIN_CHUNK_SIZE: u32 = 16;
const MAX_CHUNK_SIZE: u32 = 2048;

/// Local files up to this size are read synchronously instead of streamed.
const DEFAULT_FAST_LOCAL_MB: u64 = 32;

/// Size of each streamed transfer chunk.
const DEFAULT_TRANSFER_CHUNK_KB: usize = 64;

/// Scale tasks a single scaler keeps submitted at once.
const DEFAULT_SCALE_IN_FLIGHT: usize = 4;

const DEFAULT_CHUNK_CACHE_MB: usize = 64;

static ENV_CONFIG: Lazy<LoaderConfig> = Lazy::new(LoaderConfig::from_env);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub workers: usize,
    pub chunk_size: u32,
    pub fast_local_max_bytes: u64,
    pub transfer_chunk_bytes: usize,
    pub scale_in_flight: usize,
    pub chunk_cache_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fast_local_max_bytes: DEFAULT_FAST_LOCAL_MB * 1024 * 1024,
            transfer_chunk_bytes: DEFAULT_TRANSFER_CHUNK_KB * 1024,
            scale_in_flight: DEFAULT_SCALE_IN_FLIGHT,
            chunk_cache_bytes: DEFAULT_CHUNK_CACHE_MB * 1024 * 1024,
        }
    }
}

impl LoaderConfig {
    /// Configuration read once from `IMGDOC_*` environment variables.
    pub fn global() -> &'static LoaderConfig {
        &ENV_CONFIG
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Option<u64> {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };

        let defaults = Self::default();
        Self {
            workers: parse("IMGDOC_WORKERS")
                .map(|v| v as usize)
                .unwrap_or(defaults.workers),
            chunk_size: parse("IMGDOC_CHUNK_SIZE")
                .map(|v| v.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(defaults.chunk_size),
            fast_local_max_bytes: parse("IMGDOC_FAST_LOCAL_MB")
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.fast_local_max_bytes),
            transfer_chunk_bytes: parse("IMGDOC_TRANSFER_CHUNK_KB")
                .map(|kb| kb as usize * 1024)
                .unwrap_or(defaults.transfer_chunk_bytes),
            scale_in_flight: parse("IMGDOC_SCALE_IN_FLIGHT")
                .map(|v| v as usize)
                .unwrap_or(defaults.scale_in_flight),
            chunk_cache_bytes: parse("IMGDOC_CHUNK_CACHE_MB")
                .map(|mb| mb as usize * 1024 * 1024)
                .unwrap_or(defaults.chunk_cache_bytes),
        }
        .clamped()
    }

    fn clamped(mut self) -> Self {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.scale_in_flight = self.scale_in_flight.max(1);
        self.transfer_chunk_bytes = self.transfer_chunk_bytes.max(1024);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.clamped()
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self.clamped()
    }

    pub fn with_fast_local_max_bytes(mut self, bytes: u64) -> Self {
        self.fast_local_max_bytes = bytes;
        self
    }

    pub fn with_transfer_chunk_bytes(mut self, bytes: usize) -> Self {
        self.transfer_chunk_bytes = bytes;
        self.clamped()
    }

    pub fn with_scale_in_flight(mut self, count: usize) -> Self {
        self.scale_in_flight = count;
        self.clamped()
    }
}
