use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, StreamError};
use crate::transport::{RequestHandler, TransportServer};

pub const DEFAULT_MOUNT_PATH: &str = "/stream";

/// Registry of RTSP request handlers, keyed by mount path.
///
/// Supports a "default" mount that acts as a fallback when the requested
/// URI path doesn't match any registered mount, so that `OPTIONS *` and
/// clients guessing a path still reach the single configured stream.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<dyn RequestHandler>>>>,
    /// Path of the default (fallback) mount, used when no exact match is found.
    default_path: Arc<RwLock<Option<String>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            default_path: Arc::new(RwLock::new(None)),
        }
    }

    /// Designate a mount path as the default fallback.
    pub fn set_default(&self, path: &str) {
        *self.default_path.write() = Some(path.to_string());
    }

    /// Look up a handler by exact path.
    pub fn get(&self, path: &str) -> Option<Arc<dyn RequestHandler>> {
        self.mounts.read().get(path).cloned()
    }

    /// Resolve a handler from an RTSP URI.
    ///
    /// Tries an exact path match first, then the default mount if one has
    /// been set via [`set_default`](Self::set_default).
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<dyn RequestHandler>> {
        let path = extract_mount_path(uri);
        self.get(path).or_else(|| {
            let default = self.default_path.read();
            default.as_ref().and_then(|p| self.get(p))
        })
    }

    pub fn paths(&self) -> Vec<String> {
        self.mounts.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// Expire idle sessions on every mount.
    pub fn reap_expired(&self) {
        let handlers: Vec<_> = self.mounts.read().values().cloned().collect();
        for handler in handlers {
            handler.reap_expired();
        }
    }
}

impl TransportServer for MountRegistry {
    fn register(&self, path: &str, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(path) {
            return Err(StreamError::InvalidConfig(format!("mount {} already registered", path)));
        }
        mounts.insert(path.to_string(), handler);
        tracing::info!(path, "mount registered");
        Ok(())
    }

    fn unregister(&self, path: &str) -> bool {
        let removed = self.mounts.write().remove(path).is_some();
        if removed {
            tracing::info!(path, "mount unregistered");
        }
        removed
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/stream/trackID=1` → `/stream`
/// `rtsp://host:8554/stream/`         → `/stream`
/// `rtsp://host:8554/`                → `/`
/// `rtsp://host:8554`                 → `/stream` (default)
/// `*`                                → `/stream` (default)
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => DEFAULT_MOUNT_PATH,
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        DEFAULT_MOUNT_PATH
    };

    // Strip track suffix: /stream/trackID=1 → /stream
    let path = match path.rfind("/trackID=") {
        Some(pos) => &path[..pos],
        None => path,
    };

    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RtspRequest, RtspResponse};
    use std::net::SocketAddr;

    struct Named(&'static str);

    impl RequestHandler for Named {
        fn handle(&self, _: &RtspRequest, _: SocketAddr) -> RtspResponse {
            RtspResponse::ok().add_header("X-Mount", self.0)
        }
    }

    fn mount_name(handler: Arc<dyn RequestHandler>) -> String {
        let request = RtspRequest::parse("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap();
        let client: SocketAddr = "127.0.0.1:1".parse().unwrap();
        handler.handle(&request, client).get_header("X-Mount").unwrap().to_string()
    }

    #[test]
    fn extract_path_full_uri() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream"), "/stream");
    }

    #[test]
    fn extract_path_with_track() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream/trackID=1"), "/stream");
        assert_eq!(extract_mount_path("rtsp://10.0.0.1:8554/live/cam1/trackID=0"), "/live/cam1");
    }

    #[test]
    fn extract_path_trailing_slash() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream/"), "/stream");
        assert_eq!(extract_mount_path("rtsp://localhost:8554/"), "/");
    }

    #[test]
    fn extract_path_no_path() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554"), DEFAULT_MOUNT_PATH);
    }

    #[test]
    fn extract_path_star() {
        assert_eq!(extract_mount_path("*"), DEFAULT_MOUNT_PATH);
    }

    #[test]
    fn extract_path_bare_path() {
        assert_eq!(extract_mount_path("/camera1"), "/camera1");
    }

    #[test]
    fn register_rejects_taken_path() {
        let registry = MountRegistry::new();
        registry.register("/stream", Arc::new(Named("a"))).unwrap();
        assert!(registry.register("/stream", Arc::new(Named("b"))).is_err());
        assert_eq!(mount_name(registry.get("/stream").unwrap()), "a");

        assert!(registry.unregister("/stream"));
        assert!(!registry.unregister("/stream"));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_resolve_from_uri() {
        let registry = MountRegistry::new();
        registry.register("/stream", Arc::new(Named("stream"))).unwrap();

        assert!(registry.resolve_from_uri("rtsp://localhost:8554/stream").is_some());
        assert!(registry.resolve_from_uri("rtsp://localhost:8554/stream/trackID=0").is_some());
        // No default set: unknown path returns None
        assert!(registry.resolve_from_uri("rtsp://localhost:8554/other").is_none());
    }

    #[test]
    fn registry_resolve_fallback_to_default() {
        let registry = MountRegistry::new();
        registry.register("/stream", Arc::new(Named("stream"))).unwrap();
        registry.register("/movie", Arc::new(Named("movie"))).unwrap();
        registry.set_default("/stream");

        assert_eq!(mount_name(registry.resolve_from_uri("rtsp://h/movie").unwrap()), "movie");
        assert_eq!(mount_name(registry.resolve_from_uri("rtsp://h/anything").unwrap()), "stream");
        assert_eq!(mount_name(registry.resolve_from_uri("*").unwrap()), "stream");
        assert_eq!(registry.len(), 2);
    }
}
