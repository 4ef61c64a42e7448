//! Over-the-air software update orchestration.
//!
//! One cycle downloads the named package through the transfer engine into a
//! fresh `update/` working directory, extracts it, runs the external updater
//! with `--path <update_dir>` and uploads the install log whatever the
//! outcome. At most one cycle runs per agent; concurrent requests are
//! rejected.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use flate2::read::GzDecoder;

use crate::actions::ActionRequest;
use crate::status::{AgentError, ErrorKind, Result};
use crate::transfer::{
    Checksum, ChecksumAlgorithm, TransferDirection, TransferEngine, TransferRequest,
    TransferState,
};
use crate::value::{DataType, TypedValue};

/// Longest package name accepted, matching the platform path limit.
const PATH_MAX: usize = 4096;

/// Name of the external updater executable.
const UPDATER_NAME: &str = "iot-update";

/// Name of the install log, uploaded after every cycle.
pub const UPDATE_LOG_NAME: &str = "iot-update.log";

const DOWNLOAD_POLL: Duration = Duration::from_secs(1);

/// Description of one software update, decoded from the action request that
/// triggered it. Consumed by a single cycle.
#[derive(Debug, Clone, Default)]
pub struct OtaManifest {
    pub identifier: Option<String>,
    pub operation: Option<String>,
    pub version: Option<String>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub jwt: Option<String>,
    /// Command template run instead of the bundled updater when present.
    pub install_command: Option<String>,
    pub package: String,
    pub download_url: Option<String>,
    pub response_url: Option<String>,
}

impl OtaManifest {
    /// Builds a manifest from the parameters of a `software_update` request.
    pub fn from_request(request: &ActionRequest) -> Result<OtaManifest> {
        let package = match request.parameter_as("package", DataType::String)? {
            TypedValue::String(package) => package,
            _ => unreachable!("conversion to string yields a string"),
        };
        if package.is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "empty package name"));
        }

        let text = |name: &str| -> Option<String> {
            match request.parameter(name) {
                Some(TypedValue::String(value)) => Some(value.clone()),
                _ => None,
            }
        };

        Ok(OtaManifest {
            identifier: text("id"),
            operation: text("operation"),
            version: text("version"),
            sha256: text("sha256"),
            md5: text("md5"),
            jwt: text("jwt"),
            install_command: text("install_command"),
            package,
            download_url: text("url"),
            response_url: text("response_url"),
        })
    }

    fn checksum(&self) -> Option<Checksum> {
        if let Some(hex) = &self.sha256 {
            return Some(Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                hex: hex.to_ascii_lowercase(),
            });
        }
        self.md5.as_ref().map(|hex| Checksum {
            algorithm: ChecksumAlgorithm::Md5,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

pub struct OtaOrchestrator {
    runtime_dir: PathBuf,
    engine: TransferEngine,
    busy: AtomicBool,
    download_timeout: Duration,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OtaOrchestrator {
    pub fn new(runtime_dir: impl Into<PathBuf>, engine: TransferEngine) -> OtaOrchestrator {
        OtaOrchestrator {
            runtime_dir: runtime_dir.into(),
            engine,
            busy: AtomicBool::new(false),
            download_timeout: Duration::from_secs(15 * 60),
        }
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> OtaOrchestrator {
        self.download_timeout = timeout;
        self
    }

    pub fn update_dir(&self) -> PathBuf {
        self.runtime_dir.join("update")
    }

    /// Runs one full update cycle. Blocks the calling thread until the
    /// updater has terminated and the log upload was attempted.
    pub fn run_cycle(&self, manifest: &OtaManifest) -> Result<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AgentError::new(
                ErrorKind::BadRequest,
                "a software update is already in progress",
            ));
        }
        let _busy = BusyGuard(&self.busy);

        if manifest.package.len() > PATH_MAX {
            return Err(AgentError::new(
                ErrorKind::BadParameter,
                format!("package name exceeds {PATH_MAX} bytes"),
            ));
        }

        log::info!("software update cycle started for {:?}", manifest.package);
        let result = self.install(manifest);

        // The install log goes up regardless of how the cycle went.
        if let Err(e) = self.upload_log(manifest) {
            log::warn!("install log upload failed: {e}");
        }

        match &result {
            Ok(()) => log::info!("software update of {:?} finished", manifest.package),
            Err(e) => log::error!("software update of {:?} failed: {e}", manifest.package),
        }
        result
    }

    fn install(&self, manifest: &OtaManifest) -> Result<()> {
        let update_dir = self.update_dir();
        if update_dir.exists() {
            fs::remove_dir_all(&update_dir)?;
        }
        fs::create_dir_all(&update_dir)?;

        let package_path = self.download_package(manifest, &update_dir)?;

        let extracted = extract_archive(&package_path, &update_dir)
            .map_err(|e| AgentError::new(ErrorKind::Failure, format!("{e:#}")))?;
        log::debug!("extracted {extracted} entries from {:?}", manifest.package);

        self.execute_updater(manifest, &update_dir)
    }

    fn download_package(&self, manifest: &OtaManifest, update_dir: &Path) -> Result<PathBuf> {
        let url = manifest.download_url.as_ref().ok_or_else(|| {
            AgentError::new(ErrorKind::BadParameter, "manifest carries no download URL")
        })?;

        let package_path = update_dir.join(&manifest.package);
        // Update packages always live in the cloud's global file store.
        let request = TransferRequest {
            direction: TransferDirection::Ota,
            local_path: package_path.clone(),
            url: url.clone(),
            response_url: manifest.response_url.clone(),
            token: manifest.jwt.clone(),
            checksum: manifest.checksum(),
            expected_size: None,
            expiry: None,
            global: true,
        };
        let handle = self.engine.begin(request, None)?;

        // Wait for the package to materialize, polling once per second.
        let deadline = Instant::now() + self.download_timeout;
        loop {
            match self.engine.state(handle) {
                Some(TransferState::Completed) => {
                    self.engine.take_finished(handle);
                    return Ok(package_path);
                }
                Some(TransferState::Failed) => {
                    let error = self
                        .engine
                        .take_finished(handle)
                        .and_then(|(_, error)| error)
                        .unwrap_or_else(|| {
                            AgentError::new(ErrorKind::Failure, "package download failed")
                        });
                    return Err(error);
                }
                Some(_) => {}
                None => {
                    return Err(AgentError::new(
                        ErrorKind::Failure,
                        "package download disappeared",
                    ));
                }
            }
            if Instant::now() >= deadline {
                _ = self.engine.cancel(handle);
                return Err(AgentError::new(
                    ErrorKind::TimedOut,
                    "package download did not finish in time",
                ));
            }
            std::thread::sleep(DOWNLOAD_POLL);
        }
    }

    fn execute_updater(&self, manifest: &OtaManifest, update_dir: &Path) -> Result<()> {
        let log_path = update_dir.join(UPDATE_LOG_NAME);
        let log_file = File::create(&log_path)?;
        let log_clone = log_file.try_clone()?;

        let mut command = match &manifest.install_command {
            Some(template) => {
                let mut tokens = template.split_whitespace();
                let program = tokens.next().ok_or_else(|| {
                    AgentError::new(ErrorKind::BadParameter, "empty install command")
                })?;
                let mut command = Command::new(program);
                command.args(tokens);
                command
            }
            None => Command::new(self.stage_updater()?),
        };
        command
            .arg("--path")
            .arg(update_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_clone));

        log::info!("executing updater for {:?}", manifest.package);
        let status = command
            .status()
            .map_err(|e| AgentError::new(ErrorKind::ExecutionError, format!("updater: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(AgentError::new(
                ErrorKind::ExecutionError,
                match status.code() {
                    Some(code) => format!("updater exited with code {code}"),
                    None => "updater terminated by signal".to_string(),
                },
            ))
        }
    }

    /// Copies the bundled updater next to the update directory and runs the
    /// copy; the original must stay untouched while it replaces this very
    /// installation.
    fn stage_updater(&self) -> Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let source = exe
            .parent()
            .map(|dir| dir.join(UPDATER_NAME))
            .filter(|path| path.exists())
            .ok_or_else(|| {
                AgentError::new(
                    ErrorKind::NotFound,
                    format!("{UPDATER_NAME} not found beside the agent executable"),
                )
            })?;

        let staged = self.runtime_dir.join(UPDATER_NAME);
        fs::copy(&source, &staged)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
        }
        Ok(staged)
    }

    fn upload_log(&self, manifest: &OtaManifest) -> Result<()> {
        let log_path = self.update_dir().join(UPDATE_LOG_NAME);
        if !log_path.exists() {
            // Nothing was written, e.g. the cycle failed before the updater
            // ran; create an empty log so the upload still happens.
            File::create(&log_path)?;
        }
        let Some(url) = &manifest.response_url else {
            log::warn!("manifest carries no response URL, skipping install log upload");
            return Ok(());
        };

        let request = TransferRequest {
            direction: TransferDirection::Upload,
            local_path: log_path,
            url: url.clone(),
            response_url: None,
            token: manifest.jwt.clone(),
            checksum: None,
            expected_size: None,
            expiry: None,
            global: false,
        };
        self.engine.begin(request, None)?;
        Ok(())
    }
}

/// Unpacks a tarball, gzip-compressed or plain, into `dest`. The format is
/// detected from the gzip magic bytes. Returns the number of entries.
fn extract_archive(archive_path: &Path, dest: &Path) -> anyhow::Result<usize> {
    let mut file = File::open(archive_path)
        .with_context(|| format!("unable to open archive {archive_path:?}"))?;

    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0)).context("rewind archive")?;

    let count = if gzipped {
        unpack_entries(tar::Archive::new(GzDecoder::new(file)), dest)?
    } else {
        unpack_entries(tar::Archive::new(file), dest)?
    };

    if count == 0 {
        anyhow::bail!("archive {archive_path:?} contains no entries");
    }
    Ok(count)
}

fn unpack_entries<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> anyhow::Result<usize> {
    let mut count = 0usize;
    for entry in archive.entries().context("read archive index")? {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("entry path")?.into_owned();
        entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {path:?}"))?;
        count += 1;
    }
    Ok(count)
}
