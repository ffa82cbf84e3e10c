use std::path::Path;

use colored::Colorize;

use crate::config;
use crate::domain::hypervisor::{Hypervisor, ProxmoxClient};

pub fn run(config_path: Option<&str>) -> anyhow::Result<()> {
    let cfg = config::load(config_path.map(Path::new))?;

    println!("{}", "warden check".bold());
    println!("  database:   {}", cfg.database_path.display());
    println!("  listen:     {}", cfg.http_addr);
    println!(
        "  scheduler:  {} (tick {}s, default interval {}h)",
        if cfg.scheduler.enabled { "enabled" } else { "disabled" },
        cfg.scheduler.tick_secs,
        cfg.scheduler.default_interval_hours
    );

    if let Err(e) = cfg.validate_daemon() {
        println!("  config:     {}", "invalid".red());
        println!("  reason:     {}", e);
        std::process::exit(1);
    }
    println!("  config:     {}", "ok".green());

    let client = ProxmoxClient::new(&cfg.hypervisor)?;
    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(client.get_nodes()) {
        Ok(nodes) => {
            let online = nodes
                .iter()
                .filter(|n| n.status == crate::domain::types::NodeStatus::Online)
                .count();
            println!(
                "  hypervisor: {} ({}, {}/{} nodes online)",
                "reachable".green(),
                cfg.hypervisor.base_url,
                online,
                nodes.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("  hypervisor: {}", "unreachable".red());
            println!("  reason:     {}", e);
            std::process::exit(1);
        }
    }
}
