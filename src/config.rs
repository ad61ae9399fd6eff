use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by the cache, processor, registry scanner and cleanup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache_read_timeout: Duration,
    pub cache_list_timeout: Duration,
    pub resize_timeout: Duration,
    /// Derivatives larger than this get one extra compression pass.
    pub compress_threshold_bytes: usize,
    pub compress_quality: u8,
    pub source_cache_capacity: u64,
    pub scan_depth_limit: usize,
    pub storage_read_attempts: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_read_timeout: Duration::from_secs(2),
            cache_list_timeout: Duration::from_secs(10),
            resize_timeout: Duration::from_secs(30),
            compress_threshold_bytes: 1024 * 1024,
            compress_quality: 80,
            source_cache_capacity: 64,
            scan_depth_limit: 10,
            storage_read_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    File,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub secret_key: Option<String>,
    pub data_dir: PathBuf,
    /// Public URL prefix under which `/originals` is served.
    pub public_base_url: String,
    pub cache_backend: CacheBackend,
    pub cache_capacity: u64,
    /// Memory backend only; `None` keeps entries until evicted by capacity.
    pub cache_ttl: Option<Duration>,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut pipeline = PipelineConfig::default();
        if let Some(ms) = env_u64("CACHE_READ_TIMEOUT_MS") {
            pipeline.cache_read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CACHE_LIST_TIMEOUT_MS") {
            pipeline.cache_list_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RESIZE_TIMEOUT_MS") {
            pipeline.resize_timeout = Duration::from_millis(ms);
        }
        let cache_backend = match env_string("CACHE_BACKEND").as_deref() {
            Some("memory") => CacheBackend::Memory,
            _ => CacheBackend::File,
        };
        let port = env_u64("MCP_PORT")
            .and_then(|value| u16::try_from(value).ok())
            .unwrap_or(3000);
        Self {
            port,
            secret_key: env_string("SECRET_KEY"),
            data_dir: resolve_data_dir(),
            public_base_url: resolve_public_base_url(port),
            cache_backend,
            cache_capacity: env_u64("CACHE_CAPACITY").unwrap_or(10_000),
            cache_ttl: env_u64("CACHE_TTL_SECS").map(Duration::from_secs),
            pipeline,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Route prefixed with the secret key segment when one is configured.
    pub fn scoped_path(&self, path: &str) -> String {
        match self.secret_key.as_deref() {
            Some(value) => format!("/{value}{path}"),
            None => path.to_string(),
        }
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.data_dir.join("originals")
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.data_dir.join("derivatives")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|value| value.parse::<u64>().ok())
}

/// `PUBLIC_URL` wins, then `DOMAIN`, then the bind address. A missing scheme
/// defaults to `http://`.
fn resolve_public_base_url(port: u16) -> String {
    let raw = env_string("PUBLIC_URL")
        .or_else(|| env_string("DOMAIN"))
        .unwrap_or_else(|| format!("0.0.0.0:{port}"));
    let trimmed = raw.trim_end_matches('/');
    let base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    format!("{base}/originals")
}

fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = env_string("DATA_DIR") {
        return PathBuf::from(dir);
    }
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("asset-derivatives");
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(secret_key: Option<&str>) -> AppConfig {
        AppConfig {
            port: 3000,
            secret_key: secret_key.map(str::to_string),
            data_dir: PathBuf::from("/srv/media"),
            public_base_url: "http://localhost:3000/originals".into(),
            cache_backend: CacheBackend::File,
            cache_capacity: 10,
            cache_ttl: None,
            pipeline: PipelineConfig::default(),
        }
    }

    #[test]
    fn routes_are_scoped_by_secret() {
        assert_eq!(app(None).scoped_path("/mcp"), "/mcp");
        assert_eq!(app(Some("k3y")).scoped_path("/mcp"), "/k3y/mcp");
    }

    #[test]
    fn data_layout_lives_under_data_dir() {
        let config = app(None);
        assert_eq!(config.registry_dir(), PathBuf::from("/srv/media/registry"));
        assert_eq!(config.content_dir(), PathBuf::from("/srv/media/content"));
    }
}
