//! Device manager daemon.
//!
//! Loads the on-disk configuration, registers the built-in actions and runs
//! the agent until a shutdown signal arrives.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use edgelink::actions::{Action, ActionFlags, ParameterDirection};
use edgelink::agent::config::{load_proxy_config, DeviceManagerConfig, DEVICE_MANAGER_CFG};
use edgelink::agent::{AgentBuilder, AgentConfig, AgentHandle};
use edgelink::ota::OtaManifest;
use edgelink::protocol;
use edgelink::status::{AgentError, ErrorKind};
use edgelink::transfer::{Checksum, ChecksumAlgorithm, TransferRequest};
use edgelink::transport::TlsOptions;
use edgelink::value::{DataType, TypedValue};

const DEFAULT_CONFIG_DIR: &str = "/etc/iot";
const DEVICE_ID_FILE: &str = "device_id";

#[derive(Debug, Parser)]
#[command(name = "iot-device-manager", about = "Cloud device manager")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "configure")]
    configure: Option<PathBuf>,

    /// Run under the operating system's service supervisor.
    #[arg(short = 's', long = "service")]
    service: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .configure
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_DIR).join(DEVICE_MANAGER_CFG));
    let config = match DeviceManagerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) if e.kind() == ErrorKind::FileOpenFailed => {
            eprintln!("no configuration at {config_path:?}, using defaults");
            DeviceManagerConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("loading {config_path:?}")),
    };

    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("sqlx=warn,ureq=warn,{log_level}")),
    )
    .init();

    if cli.service {
        log::info!("running in service mode");
    }

    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
    let proxy = load_proxy_config(&config_dir).context("loading proxy configuration")?;

    let device_id = load_or_create_device_id(&config.runtime_dir)?;
    log::info!("device id is {device_id}");

    let cloud = config.cloud.clone().unwrap_or_default();
    let mut agent_config = AgentConfig::new(device_id, cloud.host.clone());
    agent_config.port = cloud.port;
    agent_config.token = cloud.token.clone();
    agent_config.runtime_dir = config.runtime_dir.clone();
    agent_config.proxy = proxy;
    if cloud.validate_cert.is_some() || cloud.ca_bundle_file.is_some() {
        agent_config.ssl = Some(TlsOptions {
            trust_store: cloud.ca_bundle_file.clone(),
            insecure: !cloud.validate_cert.unwrap_or(true),
            ..TlsOptions::default()
        });
    }

    let agent = AgentBuilder::new(agent_config)
        .build()
        .await
        .context("building the agent")?;
    let handle = agent.handle();

    register_builtin_actions(&handle, &config)?;

    let agent_task = tokio::spawn(agent.run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("shutdown signal received");
    handle.shutdown();

    agent_task
        .await
        .context("agent task panicked")?
        .context("agent loop failed")?;
    Ok(())
}

/// The device identity is generated once and kept in the runtime directory.
fn load_or_create_device_id(runtime_dir: &Path) -> Result<String> {
    let path = runtime_dir.join(DEVICE_ID_FILE);
    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let generated = uuid::Uuid::new_v4().simple().to_string();
    fs::create_dir_all(runtime_dir)
        .and_then(|()| fs::write(&path, &generated))
        .with_context(|| format!("storing device id in {path:?}"))?;
    Ok(generated)
}

fn register_builtin_actions(handle: &AgentHandle, config: &DeviceManagerConfig) -> Result<()> {
    if config.action_enabled("ping") {
        handle.actions().register(Action::callback("ping", |request| {
            request.set_out_parameter(
                "response",
                TypedValue::String("acknowledged".to_string()),
            );
            request.set_out_parameter(
                "time_stamp",
                TypedValue::String(protocol::format_timestamp(chrono::Utc::now())),
            );
            Ok(())
        }))?;
    }

    if config.action_enabled("file_download") {
        let transfers = handle.transfers().clone();
        let download_dir = config.runtime_dir.join("download");
        handle.actions().register(
            Action::callback("file_download", move |request| {
                let transfer = download_request(request, &download_dir)?;
                transfers.begin(transfer, None)?;
                Ok(())
            })
            .with_parameter("file_name", ParameterDirection::InRequired, DataType::String)
            .with_parameter("url", ParameterDirection::InRequired, DataType::String)
            .with_parameter("token", ParameterDirection::In, DataType::String)
            .with_parameter("checksum", ParameterDirection::In, DataType::String)
            .with_parameter("algorithm", ParameterDirection::In, DataType::String)
            .with_parameter("use_global_store", ParameterDirection::In, DataType::Bool),
        )?;
    }

    if config.action_enabled("file_upload") {
        let transfers = handle.transfers().clone();
        handle.actions().register(
            Action::callback("file_upload", move |request| {
                let file_path = string_param(request, "file_path")?;
                let url = string_param(request, "url")?;
                let mut transfer = TransferRequest::upload(file_path, url);
                transfer.token = optional_string_param(request, "token");
                transfer.global = bool_param(request, "use_global_store");
                transfers.begin(transfer, None)?;
                Ok(())
            })
            .with_parameter("file_path", ParameterDirection::InRequired, DataType::String)
            .with_parameter("url", ParameterDirection::InRequired, DataType::String)
            .with_parameter("token", ParameterDirection::In, DataType::String)
            .with_parameter("use_global_store", ParameterDirection::In, DataType::Bool),
        )?;
    }

    if config.action_enabled("software_update") {
        let ota = handle.ota();
        handle.actions().register(
            Action::callback("software_update", move |request| {
                let manifest = OtaManifest::from_request(request)?;
                ota.run_cycle(&manifest)
            })
            .with_parameter("package", ParameterDirection::InRequired, DataType::String)
            .with_parameter("url", ParameterDirection::In, DataType::String)
            .with_parameter("version", ParameterDirection::In, DataType::String)
            .with_parameter("sha256", ParameterDirection::In, DataType::String)
            .with_parameter("md5", ParameterDirection::In, DataType::String)
            .with_parameter("jwt", ParameterDirection::In, DataType::String)
            .with_flags(ActionFlags {
                exclusive_device: true,
                ..ActionFlags::default()
            }),
        )?;
    }

    Ok(())
}

fn string_param(
    request: &edgelink::actions::ActionRequest,
    name: &str,
) -> edgelink::Result<String> {
    match request.parameter_as(name, DataType::String)? {
        TypedValue::String(value) => Ok(value),
        _ => Err(AgentError::new(
            ErrorKind::BadParameter,
            format!("parameter {name:?} must be a string"),
        )),
    }
}

fn optional_string_param(
    request: &edgelink::actions::ActionRequest,
    name: &str,
) -> Option<String> {
    match request.parameter(name) {
        Some(TypedValue::String(value)) => Some(value.clone()),
        _ => None,
    }
}

fn bool_param(request: &edgelink::actions::ActionRequest, name: &str) -> bool {
    matches!(request.parameter(name), Some(TypedValue::Bool(true)))
}

fn download_request(
    request: &edgelink::actions::ActionRequest,
    download_dir: &Path,
) -> edgelink::Result<TransferRequest> {
    let file_name = string_param(request, "file_name")?;
    if file_name.contains('/') || file_name.contains("..") {
        return Err(AgentError::new(
            ErrorKind::BadParameter,
            "file_name must not contain path separators",
        ));
    }
    let url = string_param(request, "url")?;

    fs::create_dir_all(download_dir)?;
    let mut transfer = TransferRequest::download(download_dir.join(file_name), url);
    transfer.token = optional_string_param(request, "token");
    transfer.global = bool_param(request, "use_global_store");
    if let Some(hex) = optional_string_param(request, "checksum") {
        let algorithm = optional_string_param(request, "algorithm")
            .map(|name| ChecksumAlgorithm::parse(&name))
            .transpose()?
            .unwrap_or(ChecksumAlgorithm::Sha256);
        transfer.checksum = Some(Checksum {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        });
    }
    Ok(transfer)
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_declaration_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn device_id_is_stable_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_device_id(dir.path()).unwrap();
        let second = load_or_create_device_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
