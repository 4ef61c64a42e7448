//! Blocking HTTP(S) operations used by the transfer workers.
//!
//! Downloads resume by byte-range when a partial file is already on disk and
//! the remote honours range requests. Uploads are multipart POSTs with a
//! single `file` field. Both directions authenticate with a bearer token.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::status::{AgentError, ErrorKind};
use crate::transport::ProxyOptions;

use super::ChecksumAlgorithm;

/// Abort an attempt when fewer than this many bytes per second arrive,
/// averaged over [`LOW_SPEED_WINDOW`].
const LOW_SPEED_BYTES_PER_SEC: u64 = 50;
const LOW_SPEED_WINDOW: Duration = Duration::from_secs(30);

const COPY_CHUNK: usize = 8 * 1024;

/// Error of one HTTP attempt. `fatal` attempts are never retried.
#[derive(Debug)]
pub(crate) struct HttpError {
    pub error: AgentError,
    pub fatal: bool,
}

impl HttpError {
    fn fatal(error: AgentError) -> HttpError {
        HttpError { error, fatal: true }
    }

    fn retryable(error: AgentError) -> HttpError {
        HttpError {
            error,
            fatal: false,
        }
    }
}

pub(crate) fn build_agent(proxy: Option<&ProxyOptions>) -> ureq::Agent {
    let connector = Arc::new(
        native_tls::TlsConnector::new().expect("unable to build TLS connector"),
    );
    let mut builder = ureq::AgentBuilder::new()
        .tls_connector(connector)
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(30));

    if let Some(proxy) = proxy {
        match proxy.proxy_type {
            crate::transport::ProxyType::Http => {
                let auth = match (&proxy.username, &proxy.password) {
                    (Some(user), Some(pass)) => format!("{user}:{pass}@"),
                    (Some(user), None) => format!("{user}@"),
                    _ => String::new(),
                };
                let url = format!("http://{auth}{}:{}", proxy.host, proxy.port);
                match ureq::Proxy::new(&url) {
                    Ok(proxy) => builder = builder.proxy(proxy),
                    Err(e) => log::warn!("ignoring invalid proxy configuration: {e}"),
                }
            }
            crate::transport::ProxyType::Socks5 => {
                log::warn!(
                    "ignoring unsupported proxy setting: host {} port {} type SOCKS5",
                    proxy.host,
                    proxy.port
                );
            }
        }
    }

    builder.build()
}

/// Downloads `url` into `path`, resuming from the current file length when
/// possible. `observer` is called with the total bytes on disk after every
/// chunk. Returns the final byte count.
pub(crate) fn download(
    agent: &ureq::Agent,
    url: &str,
    token: Option<&str>,
    path: &Path,
    cancel: &AtomicBool,
    observer: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, HttpError> {
    let resume_from = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let mut request = agent.get(url);
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    if resume_from > 0 {
        request = request.set("Range", &format!("bytes={resume_from}-"));
    }

    let response = request.call().map_err(classify_ureq_error)?;

    let mut file;
    let mut written;
    match response.status() {
        206 => {
            // The remote honoured the range; append to what we have.
            file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(open_failed)?;
            file.seek(SeekFrom::End(0)).map_err(io_fatal)?;
            written = resume_from;
            log::debug!("resuming download of {url} at byte {resume_from}");
        }
        _ => {
            file = File::create(path).map_err(open_failed)?;
            written = 0;
        }
    }

    let total = response
        .header("Content-Length")
        .and_then(|len| len.parse::<u64>().ok())
        .map(|len| len + written);

    let mut reader = response.into_reader();
    let mut buf = [0u8; COPY_CHUNK];
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(HttpError::fatal(AgentError::new(
                ErrorKind::Failure,
                "transfer cancelled",
            )));
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                return Err(HttpError::retryable(AgentError::new(
                    ErrorKind::IoError,
                    format!("read from {url}: {e}"),
                )))
            }
        };
        file.write_all(&buf[..n]).map_err(io_fatal)?;
        written += n as u64;
        window_bytes += n as u64;
        observer(written, total);

        let elapsed = window_start.elapsed();
        if elapsed >= LOW_SPEED_WINDOW {
            let rate = window_bytes / elapsed.as_secs().max(1);
            if rate < LOW_SPEED_BYTES_PER_SEC {
                return Err(HttpError::retryable(AgentError::new(
                    ErrorKind::TimedOut,
                    format!("transfer rate {rate} B/s below low-speed threshold"),
                )));
            }
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    file.flush().map_err(io_fatal)?;
    Ok(written)
}

/// Uploads the file at `path` as a multipart POST with a single `file` field.
pub(crate) fn upload(
    agent: &ureq::Agent,
    url: &str,
    token: Option<&str>,
    path: &Path,
    cancel: &AtomicBool,
) -> Result<(), HttpError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(HttpError::fatal(AgentError::new(
            ErrorKind::Failure,
            "transfer cancelled",
        )));
    }

    let content = fs::read(path).map_err(open_failed)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let boundary = format!("----edgelink-{}", uuid::Uuid::new_v4().simple());
    let body = multipart_body(&boundary, &filename, &content);

    let mut request = agent.post(url).set(
        "Content-Type",
        &format!("multipart/form-data; boundary={boundary}"),
    );
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }

    request.send_bytes(&body).map_err(classify_ureq_error)?;
    Ok(())
}

/// Assembles a multipart/form-data body with one `file` field. A zero-length
/// file still produces a valid body.
pub(crate) fn multipart_body(boundary: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Computes the hex-lowercase digest of the file at `path`.
pub(crate) fn file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; COPY_CHUNK];
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(to_hex(&hasher.finalize()))
        }
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(to_hex(&hasher.finalize()))
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn classify_ureq_error(e: ureq::Error) -> HttpError {
    // Client-side rejections will not improve on retry; transport errors and
    // server-side failures might.
    let fatal = matches!(
        &e,
        ureq::Error::Status(code, _) if (400..500).contains(code) && *code != 408 && *code != 429
    );
    let error: AgentError = e.into();
    if fatal {
        HttpError::fatal(error)
    } else {
        HttpError::retryable(error)
    }
}

fn open_failed(e: std::io::Error) -> HttpError {
    HttpError::fatal(AgentError::new(ErrorKind::FileOpenFailed, e.to_string()))
}

fn io_fatal(e: std::io::Error) -> HttpError {
    HttpError::fatal(AgentError::new(ErrorKind::IoError, e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Digest of empty input, a well-known constant.
    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn checksum_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert_eq!(
            file_checksum(&path, ChecksumAlgorithm::Sha256).unwrap(),
            EMPTY_SHA256
        );
        assert_eq!(
            file_checksum(&path, ChecksumAlgorithm::Md5).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn checksum_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_checksum(&path, ChecksumAlgorithm::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn multipart_body_is_valid_for_empty_file() {
        let body = multipart_body("BOUNDARY", "empty.bin", b"");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--BOUNDARY\r\n"));
        assert!(text.contains("Content-Disposition: form-data; name=\"file\"; filename=\"empty.bin\"\r\n"));
        assert!(text.ends_with("\r\n--BOUNDARY--\r\n"));
    }

    #[test]
    fn multipart_body_contains_content() {
        let body = multipart_body("B", "data.bin", b"\x00\x01payload");
        let needle = b"\r\n\r\n\x00\x01payload\r\n--B--\r\n";
        assert!(body
            .windows(needle.len())
            .any(|window| window == needle.as_slice()));
    }
}
