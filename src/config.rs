use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use image::imageops::FilterType;
use std::{env, time::Duration};

/// How the bucket name is folded into the upstream hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketAddressing {
    /// `BUCKET_NAME=$path`: bucket is the first path segment.
    PathStyle,
    /// `BUCKET_NAME=$host`: bucket is the first label of the incoming host.
    HostStyle,
    /// A fixed bucket, addressed as `<bucket>.<endpoint>`.
    NamedBucket(String),
}

impl BucketAddressing {
    pub fn parse(value: &str) -> Self {
        match value {
            "$path" => Self::PathStyle,
            "$host" => Self::HostStyle,
            name => Self::NamedBucket(name.to_string()),
        }
    }
}

/// Sampling filter used by the transform engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl ResizeFilter {
    pub fn filter_type(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Gaussian => FilterType::Gaussian,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; built once in `main`
/// and shared read-only afterwards.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub bucket: BucketAddressing,
    pub storage_endpoint: String,
    pub storage_region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub allow_list_bucket: bool,
    /// Lowercased header names; `None` means no allow-list is applied.
    pub allowed_headers: Option<Vec<String>>,
    pub allow_url_origin: bool,
    pub upstream_timeout: Option<Duration>,
    pub cache_capacity: usize,
    /// Total body bytes the in-memory cache may hold.
    pub cache_max_bytes: usize,
    /// Bodies larger than this stream through without being cached.
    pub cache_max_entry_bytes: usize,
    /// Largest source body buffered for the transform engine.
    pub max_transform_bytes: usize,
    pub resize_filter: ResizeFilter,
}

// Hand-written so the secret never reaches the startup log line.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bucket", &self.bucket)
            .field("storage_endpoint", &self.storage_endpoint)
            .field("storage_region", &self.storage_region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("allow_list_bucket", &self.allow_list_bucket)
            .field("allowed_headers", &self.allowed_headers)
            .field("allow_url_origin", &self.allow_url_origin)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("cache_capacity", &self.cache_capacity)
            .field("cache_max_bytes", &self.cache_max_bytes)
            .field("cache_max_entry_bytes", &self.cache_max_entry_bytes)
            .field("max_transform_bytes", &self.max_transform_bytes)
            .field("resize_filter", &self.resize_filter)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Edge image proxy for S3-compatible storage")]
pub struct Args {
    /// Host to bind to (overrides PROXY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PROXY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// `$path`, `$host` or a fixed bucket name (overrides BUCKET_NAME)
    #[arg(long)]
    pub bucket_name: Option<String>,

    /// S3-compatible endpoint hostname (overrides STORAGE_ENDPOINT)
    #[arg(long)]
    pub storage_endpoint: Option<String>,

    /// Signing region (overrides STORAGE_REGION)
    #[arg(long)]
    pub storage_region: Option<String>,

    /// Allow requests that would list a bucket (overrides ALLOW_LIST_BUCKET)
    #[arg(long)]
    pub allow_list_bucket: bool,

    /// Serve absolute URLs embedded in the path (overrides ALLOW_URL_ORIGIN)
    #[arg(long)]
    pub allow_url_origin: bool,

    /// Upstream transport timeout in seconds (overrides UPSTREAM_TIMEOUT_SECS)
    #[arg(long)]
    pub upstream_timeout_secs: Option<u64>,

    /// Number of responses kept in the in-memory cache (overrides CACHE_CAPACITY)
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Byte budget of the in-memory cache (overrides CACHE_MAX_BYTES)
    #[arg(long)]
    pub cache_max_bytes: Option<usize>,

    /// Largest single body worth caching (overrides CACHE_MAX_ENTRY_BYTES)
    #[arg(long)]
    pub cache_max_entry_bytes: Option<usize>,

    /// Largest source image buffered for resizing (overrides MAX_TRANSFORM_BYTES)
    #[arg(long)]
    pub max_transform_bytes: Option<usize>,

    /// Resize sampling filter (overrides RESIZE_FILTER)
    #[arg(long, value_enum)]
    pub resize_filter: Option<ResizeFilter>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge parsed CLI args over values looked up by `env`.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            env(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("{key} must be set"))
        };

        let env_port = parse_var::<u16>(&env, "PROXY_PORT")?.unwrap_or(8787);
        let env_timeout = parse_var::<u64>(&env, "UPSTREAM_TIMEOUT_SECS")?;
        let env_capacity = parse_var::<usize>(&env, "CACHE_CAPACITY")?.unwrap_or(1024);
        let env_cache_bytes = parse_var::<usize>(&env, "CACHE_MAX_BYTES")?.unwrap_or(256 * MIB);
        let env_entry_bytes = parse_var::<usize>(&env, "CACHE_MAX_ENTRY_BYTES")?.unwrap_or(8 * MIB);
        let env_transform_bytes = parse_var::<usize>(&env, "MAX_TRANSFORM_BYTES")?.unwrap_or(32 * MIB);
        let env_filter = env("RESIZE_FILTER")
            .map(|value| {
                ResizeFilter::from_str(&value, true)
                    .map_err(|_| anyhow!("unknown RESIZE_FILTER value `{}`", value))
            })
            .transpose()?;

        let bucket_name = match args.bucket_name {
            Some(name) => name,
            None => required("BUCKET_NAME")?,
        };
        let storage_endpoint = match args.storage_endpoint {
            Some(endpoint) => endpoint,
            None => required("STORAGE_ENDPOINT")?,
        };
        let storage_region = args
            .storage_region
            .or_else(|| env("STORAGE_REGION").filter(|v| !v.is_empty()))
            .unwrap_or_else(|| region_from_endpoint(&storage_endpoint));

        let allowed_headers = env("ALLOWED_HEADERS")
            .map(|list| {
                list.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty());

        Ok(Self {
            host: args
                .host
                .or_else(|| env("PROXY_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            bucket: BucketAddressing::parse(&bucket_name),
            storage_endpoint,
            storage_region,
            access_key_id: required("STORAGE_ACCESS_KEY_ID")?,
            secret_access_key: required("STORAGE_SECRET_ACCESS_KEY")?,
            allow_list_bucket: args.allow_list_bucket || is_true(env("ALLOW_LIST_BUCKET")),
            allowed_headers,
            allow_url_origin: args.allow_url_origin || is_true(env("ALLOW_URL_ORIGIN")),
            upstream_timeout: args
                .upstream_timeout_secs
                .or(env_timeout)
                .map(Duration::from_secs),
            cache_capacity: args.cache_capacity.unwrap_or(env_capacity),
            cache_max_bytes: args.cache_max_bytes.unwrap_or(env_cache_bytes),
            cache_max_entry_bytes: args.cache_max_entry_bytes.unwrap_or(env_entry_bytes),
            max_transform_bytes: args.max_transform_bytes.unwrap_or(env_transform_bytes),
            resize_filter: args
                .resize_filter
                .or(env_filter)
                .unwrap_or(ResizeFilter::Nearest),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

const MIB: usize = 1024 * 1024;

/// Parse an optional numeric variable, naming it in the error.
fn parse_var<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {key} value `{value}`"))
        })
        .transpose()
}

fn is_true(value: Option<String>) -> bool {
    value.as_deref() == Some("true")
}

/// Guess the signing region from well-known endpoint shapes.
///
/// `s3.<region>.backblazeb2.com` and `s3.<region>.amazonaws.com` carry the
/// region; R2 always signs with `auto`. Anything else falls back to `us-east-1`.
pub fn region_from_endpoint(endpoint: &str) -> String {
    let host = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if host.ends_with(".r2.cloudflarestorage.com") {
        return "auto".to_string();
    }
    for suffix in [".backblazeb2.com", ".amazonaws.com"] {
        if let Some(rest) = host.strip_suffix(suffix) {
            if let Some(start) = rest.rfind("s3.") {
                let region = &rest[start + 3..];
                if !region.is_empty() && !region.contains('.') {
                    return region.to_string();
                }
            }
        }
    }
    "us-east-1".to_string()
}
