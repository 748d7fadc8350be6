use anyhow::Result;
use clap::Parser;
use rustphone::config::{Cli, Config};
use rustphone::useragent::UserAgentBuilder;
use rustphone::version;
use std::fs::File;
use tokio::select;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = cli
        .conf
        .map(|conf| Config::load(&conf).expect("Failed to load config"))
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = guard;
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    info!("{}", version::get_version_info());

    let ua = UserAgentBuilder::new()
        .with_config(Some(config))
        .build()
        .await
        .expect("Failed to build user agent");

    info!(
        "rustphone listening on {} (server {})",
        ua.local_addr(),
        ua.config.server
    );
    let serve = ua.serve();
    tokio::pin!(serve);
    select! {
        result = &mut serve => {
            if let Err(e) = result {
                info!("engine exited: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            ua.stop();
            // Let the engine unregister before the process goes away.
            serve.await.ok();
        }
    }
    Ok(())
}
