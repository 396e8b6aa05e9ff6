//! attach-to-notebook: relay a running Jupyter kernel's output to the terminal.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::debug;
use nbattach::dump::MessageDump;
use nbattach::{AttachConfig, AttachError, KernelTarget};

#[derive(Parser, Debug)]
#[command(name = "attach-to-notebook")]
#[command(about = "Attach to a running Jupyter kernel and stream its output to the terminal")]
struct Cli {
    /// Notebook (.ipynb), kernel id (or unique prefix), or connection file
    target: String,

    /// Config file (default: <config dir>/nbattach/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Milliseconds between heartbeat probes
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Ctrl+C detaches immediately instead of interrupting the kernel
    #[arg(long)]
    no_interrupt: bool,

    /// Don't print the idle prompt or restart notices
    #[arg(long)]
    no_status: bool,

    /// Also connect the kernel's stdin channel
    #[arg(long)]
    stdin: bool,

    /// Append every received iopub message to this file as JSON lines
    #[arg(long)]
    dump: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> AttachConfig {
        let mut config = match &self.config {
            Some(path) => nbattach::load_config_from(path),
            None => nbattach::load_config(),
        };
        if let Some(ms) = self.heartbeat_interval {
            config.heartbeat_interval_ms = ms;
        }
        if self.no_interrupt {
            config.interrupt_on_ctrl_c = false;
        }
        if self.no_status {
            config.show_status = false;
        }
        if self.stdin {
            config.open_stdin = true;
        }
        config
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config();
    debug!("[config] {:?}", config);

    let dump = match &cli.dump {
        Some(path) => Some(
            MessageDump::open(path)
                .with_context(|| format!("Failed to open dump file {}", path.display()))?,
        ),
        None => None,
    };

    let target = KernelTarget::parse(&cli.target);
    println!("Finding kernel for: {}", cli.target);

    nbattach::attach(&target, &config, dump, std::io::stdout()).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<AttachError>()
            .map(AttachError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"heartbeat_interval_ms": 500, "dead_after": 7}"#).unwrap();

        let cli = Cli::try_parse_from([
            "attach-to-notebook",
            "analysis.ipynb",
            "--config",
            path.to_str().unwrap(),
            "--heartbeat-interval",
            "250",
            "--no-interrupt",
            "--stdin",
        ])
        .unwrap();
        let config = cli.config();
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.dead_after, 7);
        assert!(!config.interrupt_on_ctrl_c);
        assert!(config.open_stdin);
        assert!(config.show_status);
    }

    #[test]
    fn test_target_required() {
        assert!(Cli::try_parse_from(["attach-to-notebook"]).is_err());
    }

    #[test]
    fn test_default_log_level() {
        let cli = Cli::try_parse_from(["attach-to-notebook", "abc"]).unwrap();
        assert_eq!(cli.log_level, "warn");
        assert!(cli.dump.is_none());
    }
}
