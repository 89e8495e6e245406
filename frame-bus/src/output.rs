use std::{
    fmt::{Display, Formatter},
    io,
    path::{Path, PathBuf},
};

/// Rolling playlist plus a bounded window of recent segments.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentedOutput {
    pub dir: PathBuf,
    pub manifest: String,
    pub segment_count: u32,
    pub segment_secs: u32,
}

impl SegmentedOutput {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(&self.manifest)
    }
}

impl Default for SegmentedOutput {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("hls"),
            manifest: "stream.m3u8".to_string(),
            segment_count: 10,
            segment_secs: 1,
        }
    }
}

/// Continuous stream pushed to a remote server. `probe_host`/`probe_port`
/// is the TCP endpoint checked before the first frame is sent.
#[derive(Clone, Debug, PartialEq)]
pub struct PushOutput {
    pub url: String,
    pub probe_host: String,
    pub probe_port: u16,
}

impl PushOutput {
    /// Derives the probe endpoint from the URL (`rtmp://host[:port]/app/key`).
    pub fn from_url(url: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("push url has no scheme: {}", url))?;
        let authority = rest.split('/').next().unwrap_or_default();
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        if authority.is_empty() {
            return Err(anyhow::anyhow!("push url has no host: {}", url));
        }

        let (host, port) = match authority.strip_prefix('[') {
            // [v6]:port
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| anyhow::anyhow!("invalid host in push url: {}", url))?;
                (host, tail.strip_prefix(':'))
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid port in push url: {}", url))?,
            None => default_port(scheme)?,
        };

        Ok(Self {
            url: url.to_string(),
            probe_host: host.to_string(),
            probe_port: port,
        })
    }

    pub fn probe_addr(&self) -> String {
        if self.probe_host.contains(':') {
            format!("[{}]:{}", self.probe_host, self.probe_port)
        } else {
            format!("{}:{}", self.probe_host, self.probe_port)
        }
    }

    /// Container format the encoder writes for this URL.
    pub fn format(&self) -> &'static str {
        let lower = self.url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            "rtsp"
        } else if lower.starts_with("srt://") || lower.starts_with("udp://") {
            "mpegts"
        } else {
            "flv"
        }
    }
}

fn default_port(scheme: &str) -> anyhow::Result<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "rtmp" => Ok(1935),
        "rtmps" => Ok(443),
        "rtsp" => Ok(554),
        "rtsps" => Ok(322),
        other => Err(anyhow::anyhow!("no default port for scheme {}", other)),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Destination {
    Segmented(SegmentedOutput),
    Push(PushOutput),
}

impl Destination {
    pub fn is_push(&self) -> bool {
        matches!(self, Destination::Push(_))
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Destination::Segmented(out) => write!(f, "hls://{}", out.manifest_path().display()),
            Destination::Push(out) => write!(f, "{}", out.url),
        }
    }
}

/// Removes everything inside `dir`, keeping the directory itself. A missing
/// directory counts as already clean. Returns how many entries were removed.
pub fn purge_artifacts(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let result = if path.is_dir() && !path.is_symlink() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("output: failed to delete {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
