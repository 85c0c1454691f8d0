//! ESS replica controller CLI.
//!
//! Runs control cycles for one replica set against AWS, either once (as a
//! scheduled job would) or on a fixed interval, and prints the set's current
//! state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ess_cloud::Aws;
use ess_controller::{
    Backends, Controller, ControllerConfig, CycleOutcome, SetStatus, Timings,
    DEFAULT_VOLUME_SIZE_GIB,
};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ess-controller", version, about = "Replica set controller for Fargate tasks")]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    set: SetArgs,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single control cycle and exit
    RunOnce,
    /// Run control cycles on a fixed interval until interrupted
    Run {
        /// Seconds between cycles
        #[arg(long, default_value = "60")]
        interval: u64,
    },
    /// Print replicas, volumes and snapshots without changing anything
    Status,
}

#[derive(Args)]
struct SetArgs {
    /// Replica set name, used in tags and DNS names
    #[arg(long, env = "STATEFULSET_NAME", global = true)]
    set_name: Option<String>,

    /// ECS cluster running the replicas
    #[arg(long, env = "CLUSTER_NAME", global = true)]
    cluster: Option<String>,

    /// Task definition for replica tasks
    #[arg(long, env = "TASK_DEFINITION_ARN", global = true)]
    task_definition_arn: Option<String>,

    /// Container receiving the environment overrides
    #[arg(long, env = "CONTAINER_NAME", global = true)]
    container_name: Option<String>,

    /// Number of replicas to keep running
    #[arg(long, env = "DESIRED_REPLICAS", default_value = "0", global = true)]
    desired_replicas: u32,

    /// DynamoDB table holding the controller lock
    #[arg(long, env = "LOCK_TABLE_NAME", global = true)]
    lock_table: Option<String>,

    /// Subnets for replica tasks (comma separated)
    #[arg(long, env = "SUBNET_IDS", value_delimiter = ',', global = true)]
    subnet_ids: Vec<String>,

    /// Security group for replica tasks
    #[arg(long, env = "SECURITY_GROUP_ID", global = true)]
    security_group_id: Option<String>,

    /// Route 53 hosted zone for replica records
    #[arg(long, env = "HOSTED_ZONE_ID", global = true)]
    hosted_zone_id: Option<String>,

    /// Domain appended to replica record names
    #[arg(long, env = "DNS_DOMAIN", global = true)]
    dns_domain: Option<String>,

    /// Target group receiving replica addresses
    #[arg(long, env = "TARGET_GROUP_ARN", global = true)]
    target_group_arn: Option<String>,

    /// Port registered with each target (target group default when unset)
    #[arg(long, env = "TARGET_PORT", global = true)]
    target_port: Option<u16>,

    /// Infrastructure role used to manage replica volumes
    #[arg(long, env = "ECS_VOLUME_TASK_ROLE", global = true)]
    volume_role_arn: Option<String>,

    /// Per-replica environment as a JSON object; `$index` is replaced
    #[arg(long, env = "TASK_ENVIRONMENT", global = true)]
    task_environment: Option<String>,

    /// Volume size in GiB
    #[arg(long, env = "VOLUME_SIZE", default_value_t = DEFAULT_VOLUME_SIZE_GIB, global = true)]
    volume_size: u32,

    /// Enable ECS Exec on replica tasks
    #[arg(long, env = "COMMAND_EXECUTION", global = true)]
    command_execution: bool,

    /// Take over a lock entry whose expiry has passed
    #[arg(long, env = "RECLAIM_EXPIRED_LOCK", global = true)]
    reclaim_expired_lock: bool,
}

impl SetArgs {
    fn into_config(self) -> Result<ControllerConfig> {
        let environment = ControllerConfig::parse_environment(
            self.task_environment.as_deref().unwrap_or_default(),
        )
        .context("Failed to parse TASK_ENVIRONMENT")?;

        Ok(ControllerConfig {
            set_name: self.set_name.unwrap_or_default(),
            cluster: self.cluster.unwrap_or_default(),
            task_definition_arn: self.task_definition_arn.unwrap_or_default(),
            container_name: self.container_name.unwrap_or_default(),
            desired_replicas: self.desired_replicas,
            lock_table: self.lock_table.unwrap_or_default(),
            subnet_ids: self
                .subnet_ids
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            security_group_id: self.security_group_id.unwrap_or_default(),
            hosted_zone_id: self.hosted_zone_id.unwrap_or_default(),
            dns_domain: self.dns_domain.unwrap_or_default(),
            target_group_arn: self.target_group_arn.unwrap_or_default(),
            target_port: self.target_port,
            volume_role_arn: self.volume_role_arn.unwrap_or_default(),
            environment,
            volume_size_gib: self.volume_size,
            enable_execute_command: self.command_execution,
            reclaim_expired_lock: self.reclaim_expired_lock,
            timings: Timings::default(),
        })
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = cli.set.into_config()?;
    let aws = Aws::from_env().context("Failed to load AWS credentials")?;
    info!(region = aws.region(), set = %config.set_name, "AWS backends configured");

    let controller = Controller::new(config, Backends::from_cloud(Arc::new(aws)))
        .context("Invalid controller configuration")?;

    match cli.command {
        Commands::RunOnce => run_once(&controller).await,
        Commands::Run { interval } => run_forever(&controller, interval).await,
        Commands::Status => {
            let status = controller
                .status()
                .await
                .context("Failed to read replica set status")?;
            print_status(&controller.config().set_name, &status);
            Ok(())
        }
    }
}

async fn run_once(controller: &Controller) -> Result<()> {
    match controller.run_cycle().await.context("Control cycle failed")? {
        CycleOutcome::Skipped(reason) => info!(reason = ?reason, "Cycle skipped"),
        CycleOutcome::Contended => info!("Cycle skipped, lock held elsewhere"),
        CycleOutcome::Completed(report) => {
            info!(report = %serde_json::to_string(&report)?, "Cycle report");
        }
        // Already logged by the controller; the next cycle retries.
        CycleOutcome::Failed { .. } => {}
    }
    Ok(())
}

async fn run_forever(controller: &Controller, interval: u64) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(interval_secs = interval, "Controller started");
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for SIGINT");
                }
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = run_once(controller).await {
                    error!(error = %format!("{e:#}"), "Cycle aborted");
                }
            }
        }
    }
}

fn print_status(set_name: &str, status: &SetStatus) {
    println!(
        "Replica set {set_name}: {} of {} replicas active",
        status.replicas.len(),
        status.desired
    );
    println!();
    println!("{:<6} {:<14} {:<16} TASK", "INDEX", "STATUS", "ADDRESS");
    for replica in &status.replicas {
        println!(
            "{:<6} {:<14} {:<16} {}",
            replica.index,
            replica.status.as_str(),
            replica.private_ip.as_deref().unwrap_or("-"),
            replica.task_arn
        );
    }

    println!();
    println!("{:<24} {:<12} {:<6} INDEX", "VOLUME", "STATE", "GIB");
    for volume in &status.volumes {
        println!(
            "{:<24} {:<12} {:<6} {}",
            volume.id,
            volume.state.as_str(),
            volume.size_gib.map_or_else(|| "-".to_string(), |s| s.to_string()),
            index_tag(set_name, &volume.tags)
        );
    }

    println!();
    println!("{:<24} {:<24} {:<26} INDEX", "SNAPSHOT", "SOURCE VOLUME", "STARTED");
    for snapshot in &status.snapshots {
        println!(
            "{:<24} {:<24} {:<26} {}",
            snapshot.id,
            snapshot.volume_id.as_deref().unwrap_or("-"),
            snapshot
                .start_time
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            index_tag(set_name, &snapshot.tags)
        );
    }
}

fn index_tag(set_name: &str, tags: &ess_cloud::Tags) -> String {
    ess_controller::TagSchema::new(set_name)
        .index_of(tags)
        .map_or_else(|| "-".to_string(), |i| i.to_string())
}
