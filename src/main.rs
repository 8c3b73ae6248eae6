/*
 * Copyright (C) 2025 The Stratovol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use stratovol::stratovol::cloud::client::HttpCloudClient;
use stratovol::stratovol::cloud::CloudClient;
use stratovol::stratovol::identity::resolve_machine_id;
use stratovol::stratovol::logger::{
    log_error, log_info, set_log_format, set_min_level, LogFormat, LogLevel,
};
use stratovol::stratovol::server;
use stratovol::stratovol::volume::MountOrchestrator;
use stratovol::stratovol::Config;

/// Volume plugin daemon bridging container hosts and remote block storage.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "stratovol.json")]
    config: PathBuf,

    /// Mount root directory (overrides the config file)
    #[arg(long)]
    mount_dir: Option<String>,

    /// Filesystem for newly formatted volumes
    #[arg(long)]
    filesystem: Option<String>,

    /// Default size for new volumes
    #[arg(long)]
    default_size: Option<String>,

    /// Default type for new volumes
    #[arg(long)]
    default_type: Option<String>,

    /// Plugin socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Only report errors
    #[arg(long)]
    quiet: bool,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.log_json {
        set_log_format(LogFormat::Json);
    }
    if args.quiet {
        set_min_level(LogLevel::Error);
    }
    if args.debug {
        set_min_level(LogLevel::Debug);
        log_info("main", "Debug logging enabled", &[]);
    }

    if let Err(err) = run(args).await {
        log_error("main", "Fatal error", &[("error", &err.to_string())]);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut config = Config::load(&args.config)?;

    if let Some(mount_dir) = args.mount_dir {
        config.mount_dir = mount_dir;
    }
    if let Some(filesystem) = args.filesystem {
        config.filesystem = filesystem;
    }
    if let Some(default_size) = args.default_size {
        config.default_size = default_size;
    }
    if let Some(default_type) = args.default_type {
        config.default_type = default_type;
    }
    if let Some(socket) = args.socket {
        config.socket_path = socket.display().to_string();
    }

    config.validate()?;

    log_info(
        "main",
        "Connecting",
        &[("endpoint", &config.identity_endpoint)],
    );
    let cloud: Arc<dyn CloudClient> = Arc::new(HttpCloudClient::connect(&config).await?);

    config.machine_id = resolve_machine_id(&config.machine_id, &cloud).await?;

    let config = Arc::new(config);
    let orchestrator = Arc::new(MountOrchestrator::new(config.clone(), cloud));

    log_info("main", "Connected", &[("machine", &config.machine_id)]);

    server::serve(orchestrator, Path::new(&config.socket_path)).await
}
