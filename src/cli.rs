//! 命令行入口
//!
//! 每个子命令返回进程退出码；`--json` 切换为 JSON 输出

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::api::health::host_status;
use crate::config::EnvConfig;
use crate::domain::repair::{LogLine, RepairOptions, RepairTrigger};
use crate::infra::HttpProbe;
use crate::services::repair;
use crate::state::{get_shutdown_token, AppState};

#[derive(Parser, Debug)]
#[command(name = "n8n-host-agent")]
#[command(about = "Keeps a self-hosted n8n instance alive: probe, repair, backup, crontab", long_about = None)]
#[command(version)]
pub struct Cli {
    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API and the watchdog
    Serve {
        #[arg(short, long, env = "N8N_AGENT_PORT")]
        port: Option<u16>,
    },
    /// Poll n8n until it answers with an accepted status
    Check(CheckArgs),
    /// Probe n8n and show the state of every supervisor
    Status,
    /// Run the repair procedure and stream its log
    Repair {
        /// Restart even if n8n is healthy
        #[arg(long)]
        force: bool,
        /// Skip the backup before restarting
        #[arg(long)]
        no_backup: bool,
    },
    /// Backup archives
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Agent-managed crontab entries
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// URL to probe (defaults to N8N_LOCAL_URL)
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub attempts: Option<u32>,
    /// Seconds between attempts
    #[arg(long)]
    pub interval: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum BackupAction {
    /// Create an archive and apply retention
    Create {
        /// Push the archive to the configured GitHub repository
        #[arg(long)]
        push: bool,
    },
    /// List archives, newest first
    List,
    /// Keep the N most recent archives
    Prune {
        #[arg(long)]
        keep: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CronAction {
    /// Print the current crontab
    Show,
    /// Remove stale entries and install the managed jobs
    Sync,
    /// Remove a managed job by name
    Remove { name: String },
}

/// 执行子命令，返回退出码
pub async fn run(cli: Cli, config: EnvConfig) -> anyhow::Result<i32> {
    let json = cli.json;
    match cli.command {
        Command::Serve { port } => {
            let state = Arc::new(AppState::new(config));
            crate::run_server(state, port).await?;
            Ok(0)
        }
        Command::Check(args) => check(&config, args, json).await,
        Command::Status => {
            let state = AppState::new(config);
            let status = host_status(&state).await;
            if json {
                print_json(&status)?;
            } else {
                println!("{}", status.n8n.summary());
                if let Some(ref public) = status.public {
                    println!("{}", public.summary());
                }
                for s in &status.supervisors {
                    match s.detail {
                        Some(ref detail) => println!("{:<8} {:?} ({})", s.kind.name(), s.state, detail),
                        None => println!("{:<8} {:?}", s.kind.name(), s.state),
                    }
                }
                match status.latest_backup {
                    Some(ref b) => println!("latest backup: {} ({} bytes)", b.name, b.size_bytes),
                    None => println!("latest backup: none"),
                }
            }
            Ok(if status.n8n.healthy { 0 } else { 1 })
        }
        Command::Repair { force, no_backup } => {
            let options = RepairOptions {
                force,
                backup_first: !no_backup,
            };
            repair_inline(Arc::new(AppState::new(config)), options, json).await
        }
        Command::Backup { action } => backup(AppState::new(config), action, json).await,
        Command::Cron { action } => cron(AppState::new(config), action, json).await,
    }
}

async fn check(config: &EnvConfig, args: CheckArgs, json: bool) -> anyhow::Result<i32> {
    let mut settings = config.n8n.probe_settings();
    if let Some(url) = args.url {
        settings.url = url;
    }
    if let Some(attempts) = args.attempts {
        settings.max_attempts = attempts;
    }
    if let Some(interval) = args.interval {
        settings.interval = Duration::from_secs(interval);
    }

    let report = HttpProbe::new()
        .wait_until_healthy(&settings, &get_shutdown_token())
        .await;
    if json {
        print_json(&report)?;
    } else {
        println!("{}", report.summary());
    }
    Ok(if report.healthy { 0 } else { 1 })
}

async fn repair_inline(state: Arc<AppState>, options: RepairOptions, json: bool) -> anyhow::Result<i32> {
    let (task_id, cancel_token) = repair::prepare(&state, RepairTrigger::Manual).await?;
    let mut rx = if json {
        None
    } else {
        state.log_hub.subscribe(&task_id).await
    };

    let mut handle = tokio::spawn(repair::execute(
        state.clone(),
        task_id.clone(),
        options,
        cancel_token,
    ));

    let task = loop {
        tokio::select! {
            finished = &mut handle => break finished.context("repair task panicked")?,
            Some(line) = next_line(&mut rx) => print_line(&line),
        }
    };
    if let Some(ref mut rx) = rx {
        while let Ok(line) = rx.try_recv() {
            print_line(&line);
        }
    }
    let task = task.with_context(|| format!("repair task {} disappeared", task_id))?;

    if json {
        print_json(&task)?;
    } else {
        for stage in &task.stages {
            println!(
                "[{:?}] {} {}",
                stage.status,
                stage.display_name,
                stage.message.as_deref().unwrap_or("")
            );
        }
    }
    Ok(task.exit_code.unwrap_or(1))
}

/// 下一行日志；没有订阅时永远挂起
async fn next_line(rx: &mut Option<broadcast::Receiver<LogLine>>) -> Option<LogLine> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(line) => return Some(line),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
        }
    }
}

fn print_line(line: &LogLine) {
    if line.stream == "stderr" {
        eprintln!("{}", line.content);
    } else {
        println!("{}", line.content);
    }
}

async fn backup(state: AppState, action: BackupAction, json: bool) -> anyhow::Result<i32> {
    match action {
        BackupAction::Create { push } => {
            let created = state.backups.create(push).await?;
            if json {
                print_json(&created)?;
            } else {
                println!("created {} ({} bytes)", created.entry.name, created.entry.size_bytes);
                for path in &created.skipped {
                    println!("skipped missing {}", path.display());
                }
                for entry in &created.retention.prune {
                    println!("pruned {}", entry.name);
                }
                if let Some(ref upload) = created.upload {
                    println!("pushed to {}:{} ({})", upload.repo, upload.path, upload.branch);
                }
            }
        }
        BackupAction::List => {
            let entries = state.backups.list().await?;
            if json {
                print_json(&entries)?;
            } else if entries.is_empty() {
                println!("no backups in {}", state.backups.config().backup_dir.display());
            } else {
                for e in &entries {
                    println!("{}  {:>12}  {}", e.modified.format("%Y-%m-%d %H:%M:%S"), e.size_bytes, e.name);
                }
            }
        }
        BackupAction::Prune { keep, dry_run } => {
            let keep = keep.unwrap_or(state.backups.config().keep);
            let plan = state.backups.prune(keep, dry_run).await?;
            if json {
                print_json(&plan)?;
            } else {
                let verb = if dry_run { "would remove" } else { "removed" };
                for entry in &plan.prune {
                    println!("{} {}", verb, entry.name);
                }
                println!("kept {}, {} {} ({} bytes)", plan.keep.len(), verb, plan.prune.len(), plan.pruned_bytes());
            }
        }
    }
    Ok(0)
}

async fn cron(state: AppState, action: CronAction, json: bool) -> anyhow::Result<i32> {
    match action {
        CronAction::Show => {
            let table = state.crontab.read().await?;
            if json {
                print_json(&table.managed_jobs())?;
            } else {
                print!("{}", table.render());
            }
            Ok(0)
        }
        CronAction::Sync => {
            let report = state.crontab.sync().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "stale removed: {}, duplicates removed: {}, updated: {}",
                    report.stale_removed,
                    report.duplicates_removed,
                    if report.updated_jobs.is_empty() {
                        "none".to_string()
                    } else {
                        report.updated_jobs.join(", ")
                    }
                );
            }
            Ok(0)
        }
        CronAction::Remove { name } => {
            let removed = state.crontab.remove(&name).await?;
            if json {
                print_json(&serde_json::json!({ "name": name, "removed": removed }))?;
            } else if removed {
                println!("removed managed job '{}'", name);
            } else {
                println!("no managed job named '{}'", name);
            }
            Ok(if removed { 0 } else { 1 })
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
