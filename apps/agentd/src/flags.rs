//! Command-line flags and configuration-file merging.
//!
//! Defaults come from the config structs, a JSON configuration file
//! overrides them, and explicitly passed flags override the file.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use uplift_agent::{AccessMode, BrokerConfig, DurationString, LogConfig, UploadableConfig};

/// Edge file-upload agent.
#[derive(Parser, Debug)]
#[command(name = "uplift-agentd", version, about)]
pub struct Args {
    /// Path to a JSON configuration file
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Glob pattern for the files to upload
    #[arg(long)]
    pub files: Option<String>,

    /// Restriction on dynamically requested globs: strict, scoped or lax
    #[arg(long)]
    pub mode: Option<AccessMode>,

    /// Local MQTT broker address
    #[arg(long)]
    pub broker: Option<String>,

    /// Username for an authorized local client
    #[arg(long)]
    pub username: Option<String>,

    /// Password for an authorized local client
    #[arg(long)]
    pub password: Option<String>,

    /// PEM certificate authority that signed the broker certificate
    #[arg(long)]
    pub ca_cert: Option<String>,

    /// PEM client certificate for the broker connection
    #[arg(long)]
    pub cert: Option<String>,

    /// Private key for the client certificate
    #[arg(long)]
    pub key: Option<String>,

    /// Name for the uploadable feature
    #[arg(long)]
    pub name: Option<String>,

    /// Upload period, e.g. 10h or 1m30s
    #[arg(long)]
    pub period: Option<DurationString>,

    /// Activate periodic uploads
    #[arg(long)]
    pub active: Option<bool>,

    /// Start of the periodic-upload window, RFC 3339
    #[arg(long)]
    pub active_from: Option<chrono::DateTime<chrono::Utc>>,

    /// End of the periodic-upload window, RFC 3339
    #[arg(long)]
    pub active_till: Option<chrono::DateTime<chrono::Utc>>,

    /// Delete successfully uploaded files
    #[arg(long)]
    pub delete: Option<bool>,

    /// Send MD5 checksums for uploaded files
    #[arg(long)]
    pub checksum: Option<bool>,

    /// Forbid new uploads while one is in progress
    #[arg(long)]
    pub single_upload: Option<bool>,

    /// Time to wait for running uploads when stopping, e.g. 30s
    #[arg(long)]
    pub stop_timeout: Option<DurationString>,

    /// PEM certificate for validating the upload endpoint
    #[arg(long)]
    pub server_cert: Option<String>,

    /// Log file location; empty logs to standard output
    #[arg(long)]
    pub log_file: Option<String>,

    /// Log level: ERROR, WARN, INFO, DEBUG or TRACE
    #[arg(long)]
    pub log_level: Option<String>,

    /// Dump the file paths matching the files glob and exit
    #[arg(long)]
    pub dump_files: bool,
}

/// Fully merged agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub broker: BrokerConfig,
    #[serde(flatten)]
    pub uploadable: UploadableConfig,
    #[serde(flatten)]
    pub log: LogConfig,

    /// Glob pattern for the files to upload.
    pub files: String,
    /// Restriction on dynamically requested globs.
    pub mode: AccessMode,
}

/// Parses flags, loads the optional configuration file and merges both.
pub fn parse() -> anyhow::Result<AgentConfig> {
    let args = Args::parse();
    let config = merge(&args, load_config_file(&args)?);

    if args.dump_files {
        dump_files(&config.files);
        std::process::exit(0);
    }

    let mut config = config;
    config.uploadable.validate()?;
    Ok(config)
}

fn load_config_file(args: &Args) -> anyhow::Result<AgentConfig> {
    let Some(path) = &args.config_file else {
        return Ok(AgentConfig::default());
    };

    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // A missing config file is only worth a warning; flags and
            // defaults still apply.
            eprintln!("config file {} not found", path.display());
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Applies explicitly passed flags over the file-provided configuration.
fn merge(args: &Args, mut config: AgentConfig) -> AgentConfig {
    macro_rules! apply {
        ($($flag:ident => $target:expr),* $(,)?) => {
            $(if let Some(value) = args.$flag.clone() {
                $target = value;
            })*
        };
    }

    apply! {
        files => config.files,
        mode => config.mode,
        broker => config.broker.broker,
        username => config.broker.username,
        password => config.broker.password,
        ca_cert => config.broker.ca_cert,
        cert => config.broker.cert,
        key => config.broker.key,
        name => config.uploadable.name,
        period => config.uploadable.period,
        active => config.uploadable.active,
        delete => config.uploadable.delete,
        checksum => config.uploadable.checksum,
        single_upload => config.uploadable.single_upload,
        stop_timeout => config.uploadable.stop_timeout,
        server_cert => config.uploadable.server_cert,
        log_file => config.log.log_file,
        log_level => config.log.log_level,
    }

    if args.active_from.is_some() {
        config.uploadable.active_from = args.active_from;
    }
    if args.active_till.is_some() {
        config.uploadable.active_till = args.active_till;
    }

    config
}

fn dump_files(files_glob: &str) {
    if files_glob.is_empty() {
        println!("No glob filter provided!");
        return;
    }

    match glob::glob(files_glob) {
        Ok(paths) => {
            let files: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
            println!("Files matching glob filter '{files_glob}': {files:?}");
        }
        Err(e) => eprintln!("invalid glob filter '{files_glob}': {e}"),
    }
}
