//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR: &str = "./files";
pub const DEFAULT_CONFIG_FILE: &str = "./config.json";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_UPLOAD_MAX_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_PROXY_HEADER: &str = "X-Real-IP";
pub const DEFAULT_ALLOWED_IPS: [&str; 2] = ["127.0.0.1", "::1"];
pub const UPLOAD_FIELD_NAME: &str = "uploadfile";
pub const PUBLIC_PREFIX: &str = "f/";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filedrop", version = VERSION_INFO, about = "filedrop upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "FILEDROP_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Directory uploaded files are stored in"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'c',
        long,
        env = "FILEDROP_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE,
        help = "JSON allowlist file, created with loopback defaults if missing"
    )]
    pub config_file: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "FILEDROP_BIND",
        default_value = "::",
        help = "Bind address for HTTP (`::` listens on IPv4 and IPv6)"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDROP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "FILEDROP_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max multipart body size in bytes"
    )]
    pub upload_max_size: usize,
    #[arg(
        long,
        env = "FILEDROP_PROXY_HEADER",
        default_value = DEFAULT_PROXY_HEADER,
        help = "Header carrying the client IP when AllowProxyIp is enabled"
    )]
    pub proxy_header: String,
    #[arg(long, env = "FILEDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}
