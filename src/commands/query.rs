//! `warden query`: talk to a warden daemon via its REST API.

use std::path::Path;

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::api::rest::{AddWhitelistBody, LogsQuery, UpdateWhitelistBody};
use crate::client::WardenClient;
use crate::config;

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Daemon health check
    Health,
    /// Aggregated dashboard counters
    Status,
    /// Hypervisor nodes
    Nodes,
    /// VMs and containers
    Resources,
    /// Auto-restart whitelist
    Whitelist,
    /// Restart audit log, newest first
    Logs {
        #[arg(long)]
        vmid: Option<u32>,
        #[arg(long)]
        node: Option<String>,
        /// start|stop|restart|clone|delete|deploy
        #[arg(long)]
        action: Option<String>,
        /// pending|success|failed
        #[arg(long)]
        status: Option<String>,
        /// auto|manual
        #[arg(long)]
        trigger: Option<String>,
        /// RFC 3339 or YYYY-MM-DD
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Restart a resource by vmid, or a node with --node-name
    Restart {
        vmid: Option<u32>,
        /// Node the vmid lives on (needed when the vmid is ambiguous)
        #[arg(long)]
        node: Option<String>,
        /// Restart a whole node instead of a resource
        #[arg(long, conflicts_with_all = ["vmid", "node"])]
        node_name: Option<String>,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Add a resource (vmid + --node) or a node (--node-name) to the whitelist
    WhitelistAdd {
        vmid: Option<u32>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long, conflicts_with_all = ["vmid", "node"])]
        node_name: Option<String>,
        #[arg(long)]
        interval_hours: Option<u32>,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Enable/disable a whitelist entry or replace its notes
    WhitelistSet {
        id: i64,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a whitelist entry
    WhitelistRemove { id: i64 },
}

pub fn run(config_path: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config_path, format, command))
}

async fn run_async(config_path: Option<&str>, format: &str, command: &QueryCommands) -> Result<()> {
    let cfg = config::load(config_path.map(Path::new))?;
    let client = WardenClient::new(&cfg.client)?;

    match command {
        QueryCommands::Health => {
            let data = client.health().await?;
            print_output(format, &data)
        }
        QueryCommands::Status => {
            let data = client.status().await?;
            print_output(format, &data)
        }
        QueryCommands::Nodes => {
            let data = client.nodes().await?;
            print_output(format, &data)
        }
        QueryCommands::Resources => {
            let data = client.resources().await?;
            print_output(format, &data)
        }
        QueryCommands::Whitelist => {
            let data = client.whitelist().await?;
            print_output(format, &data)
        }
        QueryCommands::Logs {
            vmid,
            node,
            action,
            status,
            trigger,
            since,
            limit,
        } => {
            let query = LogsQuery {
                vmid: vmid.map(|v| v.to_string()),
                node: node.clone(),
                action: action.clone(),
                status: status.clone(),
                trigger_type: trigger.clone(),
                start_date: since.clone(),
                limit: Some(limit.to_string()),
                ..Default::default()
            };
            let data = client.logs(&query).await?;
            print_output(format, &data)
        }
        QueryCommands::Restart {
            vmid,
            node,
            node_name,
            by,
        } => {
            let data = match (vmid, node_name) {
                (Some(vmid), None) => client.restart_resource(*vmid, node.as_deref(), by).await?,
                (None, Some(name)) => client.restart_node(name, by).await?,
                _ => bail!("give either a vmid or --node-name"),
            };
            print_output(format, &data)
        }
        QueryCommands::WhitelistAdd {
            vmid,
            node,
            node_name,
            interval_hours,
            notes,
            by,
        } => {
            if vmid.is_some() != node.is_some() && node_name.is_none() {
                bail!("a resource entry needs both a vmid and --node");
            }
            let body = AddWhitelistBody {
                vmid: *vmid,
                node: node.clone(),
                node_name: node_name.clone(),
                created_by: Some(by.clone()),
                notes: notes.clone(),
                interval_hours: *interval_hours,
            };
            let data = client.whitelist_add(&body).await?;
            print_output(format, &data)
        }
        QueryCommands::WhitelistSet { id, enabled, notes } => {
            if enabled.is_none() && notes.is_none() {
                bail!("nothing to change: pass --enabled and/or --notes");
            }
            let body = UpdateWhitelistBody {
                enabled: *enabled,
                notes: notes.clone(),
            };
            let data = client.whitelist_set(*id, &body).await?;
            print_output(format, &data)
        }
        QueryCommands::WhitelistRemove { id } => {
            client.whitelist_remove(*id).await?;
            println!("removed whitelist entry {}", id);
            Ok(())
        }
    }
}

fn print_output<T: serde::Serialize>(format: &str, data: &T) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
        _ => {
            let value = serde_json::to_value(data)?;
            match value.as_array() {
                Some(rows) if !rows.is_empty() && rows.iter().all(|r| r.is_object()) => {
                    print!("{}", render_table(rows));
                }
                Some(rows) if rows.is_empty() => println!("(none)"),
                _ => print_value(&value, 0),
            }
        }
    }
    Ok(())
}

/// Columns shown for list output; long free-text fields are left to `--format json`.
const HIDDEN_COLUMNS: &[&str] = &["output", "notes", "target_key", "last_synced_at"];

/// One row per object, columns taken from the first row's scalar fields.
fn render_table(rows: &[serde_json::Value]) -> String {
    let columns: Vec<&str> = match rows[0].as_object() {
        Some(first) => first
            .iter()
            .filter(|(k, v)| !v.is_object() && !v.is_array() && !HIDDEN_COLUMNS.contains(&k.as_str()))
            .map(|(k, _)| k.as_str())
            .collect(),
        None => return String::new(),
    };
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(*c).map(format_scalar).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| cells.iter().map(|r| r[i].len()).chain([c.len()]).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    let line = |values: Vec<&str>| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let header: Vec<String> = columns.iter().map(|c| c.to_uppercase()).collect();
    out.push_str(&line(header.iter().map(String::as_str).collect()));
    out.push('\n');
    for row in &cells {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out
}

fn print_value(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                match val {
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", pad, key);
                        print_value(val, indent + 1);
                    }
                    serde_json::Value::Array(arr) => {
                        if arr.is_empty() {
                            println!("{}{}: []", pad, key);
                        } else if arr.iter().all(|v| !v.is_object() && !v.is_array()) {
                            // Simple array: print inline
                            let items: Vec<String> =
                                arr.iter().map(|v| format_scalar(v)).collect();
                            println!("{}{}: {}", pad, key, items.join(", "));
                        } else {
                            println!("{}{}:", pad, key);
                            for (i, item) in arr.iter().enumerate() {
                                if item.is_object() {
                                    println!("{}  [{}]:", pad, i);
                                    print_value(item, indent + 2);
                                } else {
                                    println!("{}  - {}", pad, format_scalar(item));
                                }
                            }
                        }
                    }
                    _ => {
                        println!("{}{}: {}", pad, key, format_scalar(val));
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if item.is_object() {
                    println!("{}[{}]:", pad, i);
                    print_value(item, indent + 1);
                } else {
                    println!("{}- {}", pad, format_scalar(item));
                }
            }
        }
        _ => {
            println!("{}{}", pad, format_scalar(value));
        }
    }
}

fn format_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_table_aligns_scalar_columns() {
        let rows = vec![
            json!({"id": 1, "node": "pve1", "output": "long text", "usage": {"cpu": 0.1}}),
            json!({"id": 12, "node": "pve-backup", "output": null, "usage": {}}),
        ];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID  NODE");
        assert_eq!(lines[1], "1   pve1");
        assert_eq!(lines[2], "12  pve-backup");
    }

    #[test]
    fn test_format_scalar() {
        assert_eq!(format_scalar(&json!("x")), "x");
        assert_eq!(format_scalar(&json!(null)), "null");
        assert_eq!(format_scalar(&json!(3)), "3");
    }
}
