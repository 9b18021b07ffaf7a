//! Command-line interface.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use bazaar_runtime::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "bazaar", version, about = "Bazaar plugin runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server (the default)
    Serve,
    /// Compile every fragment of a plugin and print diagnostics
    Check {
        /// Plugin id or slug
        plugin: String,
    },
    /// List a plugin's controller bindings and ambiguous registrations
    Routes {
        /// Plugin id or slug
        plugin: String,
    },
    /// Invoke a plugin script with a JSON input
    Run {
        /// Plugin id or slug
        plugin: String,
        /// Script fragment name
        script: String,
        /// JSON input passed to the script
        #[arg(default_value = "null")]
        input: String,
    },
}

pub async fn check(state: &AppState, plugin: &str) -> Result<()> {
    let Some(check) = state.runtime().check_plugin(plugin).await? else {
        bail!("plugin '{plugin}' not found");
    };

    println!("{} ({})", check.plugin.name, check.plugin.slug);
    for fragment in &check.fragments {
        println!(
            "  {:<15} {:<30} priority {:<5} {:?}",
            fragment.kind.as_str(),
            fragment.name,
            fragment.priority,
            fragment.state
        );
        if let Some(error) = &fragment.error {
            println!(
                "      line {}, column {}: {}",
                error.diagnostic.line, error.diagnostic.column, error.diagnostic.message
            );
        }
    }

    match check.broken() {
        0 => Ok(()),
        n => bail!("{n} fragment(s) failed to compile"),
    }
}

pub async fn routes(state: &AppState, plugin: &str) -> Result<()> {
    let Some(plugin) = state.runtime().registry().find_plugin(plugin).await? else {
        bail!("plugin '{plugin}' not found");
    };

    let router = state.router();
    for binding in router.bindings(&plugin).await? {
        println!(
            "{:<7} {:<40} {} (priority {})",
            binding.method, binding.path, binding.controller, binding.priority
        );
    }

    let conflicts = router.conflicts(&plugin).await?;
    for conflict in &conflicts {
        println!(
            "ambiguous: {} {} <- {}",
            conflict.method,
            conflict.shape,
            conflict.controllers.join(", ")
        );
    }
    if !conflicts.is_empty() {
        bail!("{} ambiguous route registration(s)", conflicts.len());
    }
    Ok(())
}

pub async fn run(state: &AppState, plugin: &str, script: &str, input: &str) -> Result<()> {
    let input: Value = serde_json::from_str(input).context("input must be JSON")?;
    let output = state.runtime().invoke_script(plugin, script, input).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
