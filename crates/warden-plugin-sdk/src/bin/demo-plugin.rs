//! Demo lifecycle plugin
//!
//! A minimal controller that records every lifecycle transition to an
//! `events.log` file in the bundle directory. Useful as a template for
//! real plugins and as the payload for end-to-end exercises of the agent.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use warden_plugin_sdk::{ControllerRegistrar, LifecycleController, PluginRuntime};
use warden_rpc::protocol::PLUGIN_URL_PREFIX;

const EVENTS_FILE: &str = "events.log";

fn record(event: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(EVENTS_FILE)
        .context("opening events log")?;
    writeln!(file, "{}", event).context("writing events log")?;
    Ok(())
}

struct DemoController {
    location: String,
}

impl LifecycleController for DemoController {
    fn start(&mut self, _data: &[u8]) -> Result<()> {
        record(&format!("start {}", self.location))
    }

    fn stop(&mut self, _data: &[u8]) -> Result<()> {
        record(&format!("stop {}", self.location))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let registrar: ControllerRegistrar = Arc::new(|data: &[u8]| {
        let location = String::from_utf8_lossy(data).into_owned();
        record(&format!("init {}", location))?;
        Ok(Box::new(DemoController { location }) as Box<dyn LifecycleController>)
    });

    let runtime = PluginRuntime::new(PLUGIN_URL_PREFIX, registrar)?;
    runtime.run().await
}
