use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{register_tracing, DaemonOptions};
use crate::config::{state_dir, Config};
use crate::daemon::{Daemon, DaemonContext};

pub fn server_main(config_path: Option<PathBuf>, options: DaemonOptions) -> Result<()> {
    // loaded before forking so a bad config is reported on the terminal
    let config = Config::load(config_path.as_deref())?;

    match options.daemonize {
        true => {
            let dir = state_dir();
            std::fs::create_dir_all(&dir)?;
            let stdout = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(dir.join("daemon.out"))?;
            let stderr = stdout.try_clone()?;
            let daemonize = daemonize::Daemonize::new()
                .working_directory(&dir)
                .stdout(stdout)
                .stderr(stderr);
            match daemonize.start() {
                Ok(_) => server_main_impl(config, true),
                Err(e) => {
                    eprintln!("Error, {}", e);
                    Ok(())
                }
            }
        }
        false => server_main_impl(config, false),
    }
}

fn server_main_impl(config: Config, daemonized: bool) -> Result<()> {
    let _guard = register_tracing(daemonized)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Unable to build tokio runtime")?;

    tracing::info!(
        "Booting shellcue daemon on hostname={:} pid={} db={:} version={}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id(),
        config.database.path.display(),
        crate::GIT_VERSION,
    );
    let ctx = DaemonContext::from_config(config)?;
    let daemon = Daemon::new(ctx)?;
    rt.block_on(daemon.run())
}
