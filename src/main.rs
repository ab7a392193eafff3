#![cfg(feature = "cli")]
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn, Level};

use drmsession::error::SharedError;
use drmsession::events::{DrmSessionEventListener, EventContext, EventDispatcher};
use drmsession::looper::Immediate;
use drmsession::provisioning::DeviceProvisioner;
use drmsession::remote::RemoteEngine;
use drmsession::retry::{DefaultRetryPolicy, RetryConfig};
use drmsession::scheme::{Pssh, SchemeData, SystemId, WIDEVINE_UUID};
use drmsession::session::{Collaborators, DrmSession, SessionConfig, SessionMode, SessionState};
use drmsession::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "drmsession", version, disable_version_flag = true, about = "drmsession CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Acquire keys for a PSSH through a remote CDM and a license server.
    ///
    /// The license server must accept the raw challenge bytes and return
    /// the raw license bytes.
    License {
        config_path: PathBuf,
        pssh: String,
    },
    /// Print the fields and key ids of a base64 PSSH box.
    Pssh { data: String },
}

#[derive(Debug, Deserialize)]
struct LicenseConfig {
    remote: RemoteConfig,
    license_server: String,
    #[serde(default)]
    mode: CliMode,
    #[serde(default)]
    privacy_mode: bool,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    retry: Option<RetrySettings>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RemoteConfig {
    host: String,
    secret: String,
    device: String,
    system_id: Option<u32>,
    security_level: Option<u8>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CliMode {
    #[default]
    Streaming,
    Offline,
}

#[derive(Debug, Deserialize)]
struct RetrySettings {
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Logs every session event.
struct LogListener;

impl DrmSessionEventListener for LogListener {
    fn on_drm_session_acquired(&self, _context: &EventContext) {
        info!("[+] Opened CDM Session");
    }

    fn on_drm_keys_loaded(&self, _context: &EventContext) {
        info!("[+] License Parsed Successfully");
    }

    fn on_drm_session_manager_error(&self, _context: &EventContext, error: &SharedError) {
        error!("[-] Session error: {}", error);
    }

    fn on_drm_session_released(&self, _context: &EventContext) {
        info!("[+] Released CDM Session");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("drmsession version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::License { config_path, pssh }) => run_license(&config_path, &pssh),
        Some(Commands::Pssh { data }) => run_pssh(&data),
        None => Ok(()),
    }
}

fn run_license(config_path: &Path, pssh_str: &str) -> anyhow::Result<()> {
    let config_str = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let config: LicenseConfig =
        serde_yaml::from_str(&config_str).context("Failed to parse config")?;

    let mut engine = RemoteEngine::connect(
        &config.remote.host,
        &config.remote.secret,
        &config.remote.device,
    )
    .context("Failed to connect to remote CDM")?
    .with_privacy_mode(config.privacy_mode);
    if let (Some(system_id), Some(level)) = (config.remote.system_id, config.remote.security_level)
    {
        engine = engine.expect_device(system_id, level);
    }
    let engine = Arc::new(engine);
    info!("[+] Connected to remote CDM {}", config.remote.host);

    let transport = config.headers.iter().fold(
        HttpTransport::new(Some(config.license_server.clone()))?,
        |transport, (name, value)| transport.with_header(name, value),
    );

    let retry = config
        .retry
        .as_ref()
        .map(|r| {
            RetryConfig::new(
                r.max_retries,
                Duration::from_millis(r.base_delay_ms),
                Duration::from_millis(r.max_delay_ms),
            )
        })
        .unwrap_or_default();

    let services = Collaborators::new(
        engine.clone(),
        Arc::new(transport),
        Arc::new(DeviceProvisioner::new()),
    )
    .with_retry_policy(Arc::new(DefaultRetryPolicy::new(retry)));

    let pssh = Pssh::from_str(pssh_str).context("Invalid PSSH")?;
    let scheme_data = SchemeData::new(
        WIDEVINE_UUID,
        Some(config.license_server.clone()),
        "video/mp4",
        Some(pssh.to_bytes()),
    );
    let mode = match config.mode {
        CliMode::Streaming => SessionMode::Playback,
        CliMode::Offline => SessionMode::Download,
    };
    let session_config = SessionConfig::new(WIDEVINE_UUID)
        .with_scheme_data(vec![scheme_data])
        .with_mode(mode);

    let events = EventDispatcher::new();
    events.add_listener(Arc::new(Immediate), Arc::new(LogListener));

    let mut session = DrmSession::new(session_config, services)?;
    session.acquire(Some(&events));

    let deadline = Instant::now() + Duration::from_secs(config.timeout_secs);
    while matches!(session.state(), SessionState::Opening | SessionState::Opened) {
        if Instant::now() >= deadline {
            session.release(Some(&events));
            bail!("Timed out waiting for keys");
        }
        session.process_next(Duration::from_millis(100));
    }

    if let Some(e) = session.error().cloned() {
        session.release(Some(&events));
        bail!("License acquisition failed: {}", e);
    }

    let Some(handle) = session.media_crypto().cloned() else {
        session.release(Some(&events));
        bail!("Session has no crypto handle");
    };
    for key in engine.keys(&handle.session_id, None)? {
        info!("[{}] {}:{}", key.key_type, key.kid.as_simple(), hex::encode(&key.key));
    }
    match session.query_key_status() {
        Ok(Some(status)) => info!("[+] {} key(s) reported by key status", status.len()),
        Ok(None) => {}
        Err(e) => warn!("[-] Failed to query key status: {}", e),
    }
    if let Some(key_set_id) = session.offline_license_key_set_id() {
        info!("[+] Offline key-set id: {}", hex::encode(key_set_id));
    }

    session.release(Some(&events));
    Ok(())
}

fn run_pssh(data: &str) -> anyhow::Result<()> {
    let pssh = Pssh::from_str(data).context("Invalid PSSH")?;
    let system = SystemId::from_uuid(pssh.system_id)
        .map(|s| format!("{:?}", s))
        .unwrap_or_else(|| "Unknown".to_string());

    info!("[+] System ID: {} ({})", pssh.system_id, system);
    info!("[+] Version: {}, Flags: {}", pssh.version, pssh.flags);
    info!("[+] Init Data: {} bytes", pssh.init_data.len());
    match pssh.key_ids() {
        Ok(key_ids) => {
            for kid in key_ids {
                info!("[KID] {}", kid.as_simple());
            }
        }
        Err(e) => warn!("[-] Could not extract key ids: {}", e),
    }
    info!("[+] Box: {}", pssh.to_base64());
    Ok(())
}
