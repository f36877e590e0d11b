/// Configuration management for the store
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub feed: FeedConfig,
    pub cache: CacheConfig,
    pub polling: PollingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            cache: CacheConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// Feed engine tuning
///
/// These are tuning constants, not behavior: the engine works for any
/// positive values. `page_size` is the unit of every window advance;
/// `refill_threshold` is the per-source buffered-item level below which the
/// next page of that source is fetched in the background; `readahead` is the
/// per-source buffer level refills aim for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub page_size: usize,
    pub refill_threshold: usize,
    pub readahead: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            refill_threshold: 50,
            readahead: 100,
        }
    }
}

/// Content object cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of each entity's update event channel
    pub event_buffer_size: usize,
    /// Hydrate entries from persisted snapshots before the first live update
    pub hydrate_from_storage: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 64,
            hydrate_from_storage: true,
        }
    }
}

/// Background polling intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Owned-subplebbit discovery interval in seconds (immediate first tick)
    pub owned_subplebbits_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            owned_subplebbits_interval_secs: 60,
        }
    }
}

/// Storage location for the SQLite backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_directory = PathBuf::from("./data");
        Self {
            database: data_directory.join("plebbit-store.sqlite"),
            data_directory,
        }
    }
}

impl StorageConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let data_directory: PathBuf = env::var("PLEBBIT_STORE_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("PLEBBIT_STORE_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("plebbit-store.sqlite"));
        Self {
            data_directory,
            database,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let page_size = env::var("PLEBBIT_STORE_FEED_PAGE_SIZE")
            .unwrap_or_else(|_| "25".to_string())
            .parse()
            .unwrap_or(25);
        let refill_threshold = env::var("PLEBBIT_STORE_FEED_REFILL_THRESHOLD")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);
        let readahead = env::var("PLEBBIT_STORE_FEED_READAHEAD")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let event_buffer_size = env::var("PLEBBIT_STORE_CACHE_EVENT_BUFFER")
            .unwrap_or_else(|_| "64".to_string())
            .parse()
            .unwrap_or(64);
        let hydrate_from_storage = env::var("PLEBBIT_STORE_CACHE_HYDRATE")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let owned_subplebbits_interval_secs = env::var("PLEBBIT_STORE_OWNED_SUBS_INTERVAL")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        Self {
            feed: FeedConfig {
                page_size,
                refill_threshold,
                readahead,
            },
            cache: CacheConfig {
                event_buffer_size,
                hydrate_from_storage,
            },
            polling: PollingConfig {
                owned_subplebbits_interval_secs,
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::error::StoreResult<()> {
        if self.feed.page_size == 0 {
            return Err(crate::error::StoreError::Validation(
                "feed page_size must be positive".to_string(),
            ));
        }
        if self.feed.readahead < self.feed.refill_threshold {
            return Err(crate::error::StoreError::Validation(
                "feed readahead must be at least the refill threshold".to_string(),
            ));
        }
        Ok(())
    }
}
