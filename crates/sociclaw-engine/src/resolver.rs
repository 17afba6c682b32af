//! Turns an arbitrary image reference into an inline `data:image/...;base64,` string.
//!
//! Local reads are confined to the allowed roots. Remote fetches need an explicit
//! opt-in plus a host allowlist, are https-only, skip private address literals and
//! re-check the host after redirects. Every rejection is logged and yields `None`.
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use sociclaw_contracts::images::{
    is_inline_image, mime_for_path, parse_data_url, sniff_image_mime, ResolvedImage,
};
use sociclaw_contracts::retry::RetryPolicy;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::transport::{HttpRequest, RedirectGuard, RetryTransport};

const DEFAULT_ROOT_DIRS: [&str; 2] = [".sociclaw", ".tmp"];

/// Canonical directories that bound local reads. Never contains a filesystem root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRoots {
    roots: Vec<PathBuf>,
}

impl AllowedRoots {
    /// Relative entries join `base_dir`. Absolute entries are skipped unless
    /// `allow_absolute` is set. When nothing usable remains, the defaults
    /// `.sociclaw` and `.tmp` under `base_dir` apply.
    pub fn resolve(entries: &[PathBuf], base_dir: &Path, allow_absolute: bool) -> Self {
        let mut candidates = Vec::new();
        for entry in entries {
            let expanded = expand_home(entry);
            if expanded.is_absolute() && !allow_absolute {
                warn!(
                    root = %expanded.display(),
                    "ignoring absolute image input root without explicit opt-in"
                );
                continue;
            }
            let joined = if expanded.is_absolute() {
                expanded
            } else {
                base_dir.join(expanded)
            };
            let resolved = canonical_or_lexical(&joined);
            if resolved.parent().is_none() {
                warn!(root = %resolved.display(), "ignoring filesystem root as image input root");
                continue;
            }
            candidates.push(resolved);
        }
        if candidates.is_empty() {
            candidates = DEFAULT_ROOT_DIRS
                .iter()
                .map(|dir| canonical_or_lexical(&base_dir.join(dir)))
                .collect();
        }

        let mut roots: Vec<PathBuf> = Vec::new();
        for root in candidates {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// `path` must already be canonical.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Host patterns: exact names, `*.suffix` (which also matches the bare suffix), or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowlist {
    patterns: Vec<String>,
}

impl HostAllowlist {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut patterns: Vec<String> = Vec::new();
        for entry in entries {
            let pattern = normalize_host(entry.as_ref());
            if !pattern.is_empty() && !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }
        self.patterns.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            match pattern.strip_prefix("*.") {
                Some(base) => host == base || host.ends_with(&format!(".{base}")),
                None => host == *pattern,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteUrlRejection {
    #[error("not a valid URL")]
    Malformed,
    #[error("scheme '{0}' is not https")]
    NotHttps(String),
    #[error("host '{0}' is not fetchable")]
    ForbiddenHost(String),
    #[error("address {0} is in a non-public range")]
    NonPublicAddress(IpAddr),
    #[error("host '{0}' is not in the allowlist")]
    HostNotAllowed(String),
}

pub struct ImageInputResolver {
    max_payload_bytes: usize,
    base_dir: PathBuf,
    roots: AllowedRoots,
    hosts: HostAllowlist,
    allow_remote_fetch: bool,
    disable_inline_fallback: bool,
    max_redirects: usize,
    request_timeout: Duration,
    retry: RetryPolicy,
    transport: RetryTransport,
}

impl ImageInputResolver {
    pub fn new(config: &ResolverConfig, transport: RetryTransport) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            base_dir: config.base_dir.clone(),
            roots: AllowedRoots::resolve(
                &config.allowed_roots,
                &config.base_dir,
                config.allow_absolute_roots,
            ),
            hosts: HostAllowlist::new(&config.allowed_hosts),
            allow_remote_fetch: config.allow_remote_fetch,
            disable_inline_fallback: config.disable_inline_fallback,
            max_redirects: config.max_redirects,
            request_timeout: config.request_timeout,
            retry: config.retry.clone(),
            transport,
        }
    }

    pub fn allowed_roots(&self) -> &AllowedRoots {
        &self.roots
    }

    /// Inline data URL for `reference`, or `None` when it cannot or must not be embedded.
    pub fn resolve_data_url(&self, reference: &str) -> Option<String> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        if is_inline_image(reference) {
            return self.check_inline(reference);
        }

        let image = match Url::parse(reference) {
            Ok(url) if url.scheme() == "file" => {
                let path = url.to_file_path().ok().or_else(|| {
                    warn!("rejected file URI that does not name a local path");
                    None
                })?;
                self.read_local(&path)
            }
            // Single-letter schemes are Windows drive prefixes.
            Ok(url) if url.scheme().len() > 1 => self.fetch_remote(url),
            _ => self.read_local(Path::new(reference)),
        }?;
        Some(image.to_data_url())
    }

    fn check_inline(&self, reference: &str) -> Option<String> {
        let Some(inline) = parse_data_url(reference) else {
            warn!("rejected malformed inline image reference");
            return None;
        };
        let size = inline.decoded_len();
        if size > self.max_payload_bytes {
            warn!(
                bytes = size,
                limit = self.max_payload_bytes,
                "rejected oversized inline image reference"
            );
            return None;
        }
        Some(reference.to_string())
    }

    fn read_local(&self, raw: &Path) -> Option<ResolvedImage> {
        let expanded = expand_home(raw);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        };
        let canonical = match fs::canonicalize(&joined) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "image reference is not an existing local path");
                return None;
            }
        };
        let metadata = match fs::metadata(&canonical) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                warn!(path = %canonical.display(), "rejected local image reference that is not a regular file");
                return None;
            }
        };
        if !self.roots.contains(&canonical) {
            warn!(path = %canonical.display(), "blocked local image path outside allowed roots");
            return None;
        }
        if metadata.len() > self.max_payload_bytes as u64 {
            warn!(
                path = %canonical.display(),
                bytes = metadata.len(),
                limit = self.max_payload_bytes,
                "rejected oversized local image"
            );
            return None;
        }

        let mut bytes = Vec::new();
        let read = File::open(&canonical).and_then(|file| {
            file.take(self.max_payload_bytes as u64 + 1)
                .read_to_end(&mut bytes)
        });
        if let Err(err) = read {
            warn!(path = %canonical.display(), error = %err, "failed to read local image");
            return None;
        }

        let Some(content_type) = sniff_image_mime(&bytes).or_else(|| mime_for_path(&canonical)) else {
            warn!(path = %canonical.display(), "blocked non-image local file");
            return None;
        };
        self.build(bytes, content_type, "local")
    }

    /// Pure URL policy check; performs no network I/O.
    pub fn check_remote_url(&self, raw: &str) -> Result<Url, RemoteUrlRejection> {
        check_remote_target(&self.hosts, raw)
    }

    /// GET for a vetted URL. Every redirect hop passes the same URL policy
    /// before it is followed.
    fn remote_request(&self, url: &Url) -> HttpRequest {
        let hosts = self.hosts.clone();
        let guard: RedirectGuard = Arc::new(move |next: &Url| {
            check_remote_target(&hosts, next.as_str())
                .map(|_| ())
                .map_err(|reason| reason.to_string())
        });
        HttpRequest::get(url.as_str(), self.request_timeout)
            .header("Accept", "image/*")
            .with_body_limit(self.max_payload_bytes)
            .with_max_redirects(self.max_redirects)
            .with_redirect_guard(guard)
    }

    fn fetch_remote(&self, url: Url) -> Option<ResolvedImage> {
        if !self.allow_remote_fetch {
            warn!("remote image fetch disabled; set SOCICLAW_ALLOW_IMAGE_URL_INPUT to enable");
            return None;
        }
        if self.hosts.is_empty() {
            warn!("remote image fetch enabled without a host allowlist; refusing");
            return None;
        }
        if self.disable_inline_fallback {
            warn!("inline fallback for remote images disabled");
            return None;
        }
        let url = match self.check_remote_url(url.as_str()) {
            Ok(url) => url,
            Err(reason) => {
                warn!(reason = %reason, "blocked remote image URL");
                return None;
            }
        };

        let request = self.remote_request(&url);
        let response = match self.transport.execute(&request, &self.retry) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "remote image fetch failed");
                return None;
            }
        };
        if !response.is_success() {
            warn!(status = response.status, "remote image fetch returned non-success status");
            return None;
        }
        let final_url = match self.check_remote_url(&response.final_url) {
            Ok(final_url) => final_url,
            Err(reason) => {
                warn!(reason = %reason, "blocked remote image after redirect");
                return None;
            }
        };
        if response.body_truncated {
            warn!(limit = self.max_payload_bytes, "remote image exceeds size limit");
            return None;
        }

        let header_type = response
            .content_type()
            .filter(|value| value.starts_with("image/") && !value.contains("svg"));
        let content_type = header_type
            .or_else(|| sniff_image_mime(&response.body).map(str::to_string))
            .or_else(|| mime_for_path(Path::new(final_url.path())).map(str::to_string));
        let Some(content_type) = content_type else {
            warn!(host = final_url.host_str().unwrap_or_default(), "blocked non-image remote content");
            return None;
        };
        self.build(response.body, &content_type, "remote")
    }

    fn build(&self, bytes: Vec<u8>, content_type: &str, origin: &'static str) -> Option<ResolvedImage> {
        match ResolvedImage::new(bytes, content_type, self.max_payload_bytes) {
            Ok(image) => {
                debug!(origin, content_type = image.content_type(), bytes = image.len(), "resolved image input");
                Some(image)
            }
            Err(reason) => {
                warn!(origin, reason = %reason, "rejected image input");
                None
            }
        }
    }
}

fn check_remote_target(hosts: &HostAllowlist, raw: &str) -> Result<Url, RemoteUrlRejection> {
    let url = Url::parse(raw).map_err(|_| RemoteUrlRejection::Malformed)?;
    if url.scheme() != "https" {
        return Err(RemoteUrlRejection::NotHttps(url.scheme().to_string()));
    }
    let host = normalize_host(
        url.host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']'),
    );
    if host.is_empty() || host == "localhost" || host.ends_with(".local") {
        return Err(RemoteUrlRejection::ForbiddenHost(host));
    }
    if let Ok(addr) = host.parse::<IpAddr>() {
        check_public_ip(addr)?;
    }
    if !hosts.matches(&host) {
        return Err(RemoteUrlRejection::HostNotAllowed(host));
    }
    Ok(url)
}

fn check_public_ip(addr: IpAddr) -> Result<(), RemoteUrlRejection> {
    let blocked = match addr {
        IpAddr::V4(v4) => is_non_public_v4(v4),
        IpAddr::V6(v6) => is_non_public_v6(v6),
    };
    if blocked {
        Err(RemoteUrlRejection::NonPublicAddress(addr))
    } else {
        Ok(())
    }
}

fn is_non_public_v4(addr: Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_documentation()
        || a == 0
        || (a == 100 && (64..128).contains(&b))
        || (a == 192 && b == 0 && c == 0)
        || (a == 198 && (b == 18 || b == 19))
        || a >= 240
}

fn is_non_public_v6(addr: Ipv6Addr) -> bool {
    if let Some(embedded) = embedded_ipv4(addr) {
        return is_non_public_v4(embedded);
    }
    let segments = addr.segments();
    let first = segments[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // ::/8
        || first < 0x0100
        // 100::/64 discard-only
        || (first == 0x0100 && segments[1..4] == [0, 0, 0])
        // 2001::/23 IETF protocol assignments
        || (first == 0x2001 && segments[1] < 0x0200)
        || (first == 0x2001 && segments[1] == 0x0db8)
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site-local
        || (first & 0xffc0) == 0xfec0
}

/// IPv4 address carried by mapped (`::ffff:0:0/96`), compatible (`::/96`) and
/// NAT64 (`64:ff9b::/96`, `64:ff9b:1::/48`) forms.
fn embedded_ipv4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return Some(mapped);
    }
    let segments = addr.segments();
    let tail = Ipv4Addr::new(
        (segments[6] >> 8) as u8,
        segments[6] as u8,
        (segments[7] >> 8) as u8,
        segments[7] as u8,
    );
    let carries_ipv4 = segments[..6] == [0; 6]
        || segments[..6] == [0x0064, 0xff9b, 0, 0, 0, 0]
        || segments[..3] == [0x0064, 0xff9b, 0x0001];
    carries_ipv4.then_some(tail)
}

fn normalize_host(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

fn canonical_or_lexical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| normalize_lexically(path))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
