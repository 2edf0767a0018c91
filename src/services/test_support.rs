//! Fakes and fixtures shared by the service tests.

use crate::{
    config::{AppConfig, Args},
    errors::FetchError,
    models::upstream::{ByteStream, SignedRequest, UpstreamResponse},
    services::upstream::Upstream,
};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Cursor},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Upstream that replays a fixed script and records what it was sent.
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Result<UpstreamResponse, FetchError>>>,
    sent: Mutex<Vec<SignedRequest>>,
    calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new(script: Vec<Result<UpstreamResponse, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SignedRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: SignedRequest) -> Result<UpstreamResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Transport("script exhausted".into())))
    }
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

pub fn response(status: u16, header_pairs: &[(&str, &str)], body: impl Into<Bytes>) -> UpstreamResponse {
    UpstreamResponse::from_bytes(StatusCode::from_u16(status).unwrap(), headers(header_pairs), body)
}

/// Response whose body raises `dropped` once the body is dropped unread.
pub fn response_with_drop_flag(
    status: u16,
    header_pairs: &[(&str, &str)],
    dropped: Arc<AtomicBool>,
) -> UpstreamResponse {
    struct Guard(Arc<AtomicBool>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let guard = Guard(dropped);
    let body: ByteStream = futures::stream::once(async move {
        let _guard = guard;
        Ok(Bytes::from_static(b"full object"))
    })
    .boxed();
    UpstreamResponse::new(StatusCode::from_u16(status).unwrap(), headers(header_pairs), body)
}

/// Response whose body raises `polled` the first time anyone reads it.
pub fn response_with_poll_flag(
    status: u16,
    header_pairs: &[(&str, &str)],
    body: Vec<u8>,
    polled: Arc<AtomicBool>,
) -> UpstreamResponse {
    let body: ByteStream = futures::stream::once(async move {
        polled.store(true, Ordering::SeqCst);
        Ok(Bytes::from(body))
    })
    .boxed();
    UpstreamResponse::new(StatusCode::from_u16(status).unwrap(), headers(header_pairs), body)
}

/// Config with credentials filled in and the given overrides applied.
pub fn config_with(overrides: &[(&str, &str)]) -> AppConfig {
    let mut env: HashMap<String, String> = [
        ("BUCKET_NAME", "$path"),
        ("STORAGE_ENDPOINT", "s3.us-west-004.backblazeb2.com"),
        ("STORAGE_ACCESS_KEY_ID", "test-key-id"),
        ("STORAGE_SECRET_ACCESS_KEY", "test-secret"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        env.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_sources(Args::default(), |key| env.get(key).cloned()).unwrap()
}

pub fn test_config() -> AppConfig {
    config_with(&[])
}

/// Solid-colour image encoded in `format`.
pub fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90])));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded_image(width, height, ImageFormat::Png)
}

pub fn image_dimensions(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    (img.width(), img.height())
}

/// Formatted log output captured while a [`LogCapture`] guard is alive.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    /// Route this thread's events at `WARN` and above into memory.
    pub fn warnings() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || CaptureWriter(sink.clone()))
            .finish();
        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
