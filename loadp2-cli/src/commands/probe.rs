//! `probe` command: handshake only.

use anyhow::Result;
use console::style;
use loadp2::Session;

use crate::Cli;
use crate::commands::{connect, session_config};
use crate::config::Config;

/// Find a P2 and report what it said.
pub(crate) fn cmd_probe(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let settings = session_config(cli, config)?;
    let found = connect(cli, config, &settings)?;
    let name = found.name.clone();
    let mut session = Session::new(found.port, settings, Some(found.version));

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": name,
                "version": found.version.to_string(),
                "strategy": session.strategy().to_string(),
                "clock_mode": format!("{:#010x}", session.clock_mode()),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        eprintln!("  {:<10} {}", style("Port").bold(), name);
        eprintln!("  {:<10} {}", style("Version").bold(), found.version);
        eprintln!("  {:<10} {}", style("Mode").bold(), session.strategy());
        eprintln!(
            "  {:<10} {:#010x}",
            style("Clock").bold(),
            session.clock_mode()
        );
    }

    session.close()?;
    Ok(())
}
