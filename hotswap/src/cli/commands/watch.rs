//! Watch command: run the pipeline against local directories

use crate::cli::app::WatchArgs;
use anyhow::{Context, Result, bail};
use chrono::Local;
use hotswap_core::{
    AgentConfig, ClassName, HotswapAgent, Loader, RedefinitionBackend,
    RedefinitionError, WatchFileEvent, WatchFilter,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const PLUGIN: &str = "Cli";

/// Backend that reports redefinitions instead of performing them
#[derive(Debug)]
struct LoggingBackend {
    json: bool,
}

impl RedefinitionBackend for LoggingBackend {
    fn reload(&self, class_name: &str, bytes: &[u8]) -> Result<(), RedefinitionError> {
        info!("Would redefine {} ({} bytes)", class_name, bytes.len());
        Ok(())
    }

    fn reload_all(&self, classes: &BTreeMap<String, Vec<u8>>) -> Result<(), RedefinitionError> {
        let names: Vec<&str> = classes.keys().map(String::as_str).collect();
        if self.json {
            println!("{}", json!({ "time": timestamp(), "reload": names }));
        } else {
            println!("[{}] reload {}", timestamp(), names.join(", "));
        }
        for (class_name, bytes) in classes {
            self.reload(class_name, bytes)?;
        }
        Ok(())
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

fn class_line(event: &WatchFileEvent, name: &ClassName, json: bool) -> String {
    if json {
        json!({
            "time": timestamp(),
            "event": event.kind,
            "class": name.as_str(),
            "uri": event.uri.as_str(),
        })
        .to_string()
    } else {
        format!("[{}] {:<6} class {}", timestamp(), event.kind, name)
    }
}

fn resource_line(event: &WatchFileEvent, json: bool) -> String {
    if json {
        json!({
            "time": timestamp(),
            "event": event.kind,
            "resource": event.uri.as_str(),
        })
        .to_string()
    } else {
        format!("[{}] {:<6} resource {}", timestamp(), event.kind, event.path.display())
    }
}

/// Execute the watch command until Ctrl-C
pub async fn execute(args: WatchArgs, config_path: Option<PathBuf>) -> Result<()> {
    for dir in &args.dirs {
        if !dir.is_dir() {
            bail!("Not a directory: {}", dir.display());
        }
    }

    let mut config = match &config_path {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    config.auto_hotswap = true;

    let json = args.json;
    let agent = HotswapAgent::new(config)?.with_backend(Arc::new(LoggingBackend { json }));
    let loader = agent.register_loader(Loader::from_dirs("cli", &args.dirs));

    let classes = WatchFilter::class_files().timeout(args.timeout_ms);
    agent
        .register_handler(loader, PLUGIN, "print_class", classes, move |event: WatchFileEvent, name: ClassName| {
            println!("{}", class_line(&event, &name, json));
        })
        .context("Unable to watch classes")?;

    if let Some(pattern) = &args.resources {
        let resources = WatchFilter::resource("").filter(pattern.clone()).timeout(args.timeout_ms);
        agent
            .register_handler(loader, PLUGIN, "print_resource", resources, move |event: WatchFileEvent| {
                println!("{}", resource_line(&event, json));
            })
            .context("Unable to watch resources")?;
    }

    agent.start()?;
    info!("Watching {} directories, press Ctrl-C to stop", args.dirs.len());

    tokio::signal::ctrl_c().await.context("Unable to listen for Ctrl-C")?;

    let stats = agent.scheduler().stats();
    agent.stop();
    info!(
        "Stopped: {} scheduled, {} merged, {} executed, {} failed",
        stats.scheduled, stats.merged, stats.executed, stats.failed
    );
    Ok(())
}
