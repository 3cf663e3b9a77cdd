//! GPU CLI - GPU clusters on GKE for AI/ML workloads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloud::gke::live_status;
use cloud::{manifest, ExportOptions, GcsModelRepo, Gke, GpuNodePoolConfig, GpuType, TokenSource};
use gpu::{deployment_spec, GpuClusterPlan, DEFAULT_POOL};
use lifecycle::{LifecycleConfig, LiveStatus, Manager, ResourceSpec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// GPU CLI - Bring up GPU clusters on GKE and tear them down again.
#[derive(Parser)]
#[command(name = "gpu")]
#[command(about = "Create GPU clusters on GKE, deploy workloads, clean up on exit")]
struct Cli {
    /// GCP project ID (or set `GCP_PROJECT` env var).
    #[arg(long, env = "GCP_PROJECT")]
    project: String,

    /// Zone or region of the clusters (or set `GCP_ZONE` env var).
    #[arg(long, env = "GCP_ZONE", default_value = "us-central1-a")]
    location: String,

    /// `OAuth2` access token; the GCE metadata server is used when unset.
    #[arg(long, env = "GCP_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// TOML file with per-kind timeouts and poll intervals.
    #[arg(long, env = "GPU_LIFECYCLE_CONFIG")]
    config: Option<PathBuf>,

    /// Minimum milliseconds between GKE API calls.
    #[arg(long, default_value = "1000")]
    throttle_ms: u64,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster with a GPU node pool, deploy workloads, then tear it all down.
    Up {
        /// Cluster name.
        #[arg(long)]
        cluster: String,

        /// GPU node pool name.
        #[arg(long, default_value = DEFAULT_POOL)]
        pool: String,

        /// GPU type: t4, v100, p100, p4 or k80.
        #[arg(long, default_value = "t4")]
        gpu_type: GpuType,

        /// GPUs per GPU node (1-8).
        #[arg(long, default_value = "1")]
        gpus: u32,

        /// vCPUs per GPU node (n1-standard sizes).
        #[arg(long, default_value = "8")]
        vcpus: u32,

        /// Number of GPU nodes.
        #[arg(long, default_value = "1")]
        gpu_nodes: u32,

        /// Machine type of the default pool.
        #[arg(long, default_value = "e2-standard-4")]
        machine_type: String,

        /// Nodes in the default pool.
        #[arg(long, default_value = "1")]
        nodes: u32,

        /// Install NVIDIA drivers on the GPU nodes.
        #[arg(long, default_value = "false")]
        drivers: bool,

        /// Manifest files to apply to the cluster (repeatable).
        #[arg(long = "manifest")]
        manifests: Vec<PathBuf>,

        /// Tracked deployment as NAME=FILE, waited on and deleted on exit (repeatable).
        #[arg(long = "deployment", value_parser = parse_deployment)]
        deployments: Vec<(String, PathBuf)>,

        /// Namespace of tracked deployments.
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Leave the cluster and GPU pool running on exit.
        #[arg(long, default_value = "false")]
        keep: bool,

        /// Wait for Ctrl-C before tearing down.
        #[arg(long, default_value = "false")]
        hold: bool,
    },

    /// Tear down a cluster left running by `up --keep`.
    Down {
        /// Cluster name.
        #[arg(long)]
        cluster: String,

        /// Skip confirmation prompt.
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,
    },

    /// List clusters and their node pools.
    Status,

    /// Upload a local model repository to a Cloud Storage bucket.
    Export {
        /// Bucket name; created in the project if missing.
        #[arg(long)]
        bucket: String,

        /// Local model repository, one directory per model.
        #[arg(long, default_value = "model_repository")]
        repo_dir: PathBuf,

        /// Keep objects already in the bucket.
        #[arg(long, default_value = "false")]
        keep_existing: bool,

        /// Keep the local model directories after upload.
        #[arg(long, default_value = "false")]
        keep_local: bool,
    },
}

/// Options of `gpu up` that act after the resources exist.
struct Workloads {
    drivers: bool,
    manifests: Vec<PathBuf>,
    deployments: Vec<(String, PathBuf)>,
    namespace: String,
    hold: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => LifecycleConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => LifecycleConfig::default(),
    };

    let tokens = match cli.access_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => TokenSource::Static(token.to_string()),
        _ => TokenSource::metadata(),
    };
    let gke = Gke::new(&cli.project, &cli.location, tokens.clone())
        .context("Failed to create GKE client")?
        .with_throttle(Duration::from_millis(cli.throttle_ms));
    let gke = Arc::new(gke);

    match cli.command {
        Commands::Up {
            cluster,
            pool,
            gpu_type,
            gpus,
            vcpus,
            gpu_nodes,
            machine_type,
            nodes,
            drivers,
            manifests,
            deployments,
            namespace,
            keep,
            hold,
        } => {
            let plan = GpuClusterPlan {
                cluster,
                machine_type,
                nodes,
                pool,
                gpu: GpuNodePoolConfig::new(vcpus, gpus, gpu_type)?.node_count(gpu_nodes),
            };
            let workloads = Workloads {
                drivers,
                manifests,
                deployments,
                namespace,
                hold,
            };
            up(gke, config, plan, workloads, keep).await?;
        }

        Commands::Down { cluster, yes } => {
            if !yes {
                println!("⚠️  Are you sure you want to delete cluster {cluster}?");
                println!("   All node pools and workloads on it are deleted too.");
                println!("   Use --yes to skip this prompt.");
                return Ok(());
            }

            let manager = Manager::new(gke.clone(), config);
            let resource = manager
                .adopt(
                    ResourceSpec::cluster(&cluster, serde_json::json!({})),
                    gke.cluster_handle(&cluster),
                )
                .await
                .with_context(|| format!("Cluster {cluster} is not running"))?;
            resource.destroy().await?;
            println!("\n✅ Cluster {cluster} deleted");
        }

        Commands::Status => {
            let clusters = gke.list_clusters().await?;

            println!(
                "\n{:<30} {:<18} {:<12} {:<20}",
                "CLUSTER", "STATUS", "NODES", "ENDPOINT"
            );
            println!("{}", "-".repeat(80));

            for cluster in clusters {
                println!(
                    "{:<30} {} {:<15} {:<12} {:<20}",
                    cluster.name,
                    status_emoji(&cluster.status),
                    cluster.status,
                    cluster.current_node_count.unwrap_or(0),
                    cluster.endpoint.unwrap_or_default()
                );
                for pool in cluster.node_pools {
                    let status = pool.status.unwrap_or_default();
                    let accelerators = pool
                        .config
                        .map(|config| {
                            config
                                .accelerators
                                .iter()
                                .map(|a| format!("{}x {}", a.accelerator_count, a.accelerator_type))
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    println!(
                        "  └─ {:<25} {} {:<15} {}",
                        pool.name,
                        status_emoji(&status),
                        status,
                        accelerators
                    );
                }
            }
            println!();
        }

        Commands::Export {
            bucket,
            repo_dir,
            keep_existing,
            keep_local,
        } => {
            let repo = GcsModelRepo::new(&cli.project, bucket, tokens)
                .context("Failed to create Cloud Storage client")?;
            let options = ExportOptions {
                start_fresh: !keep_existing,
                clear: !keep_local,
            };
            let uploaded = repo
                .export_repo(&repo_dir, options)
                .await
                .with_context(|| format!("Failed to export {}", repo_dir.display()))?;
            for name in &uploaded {
                println!("   📦 gs://{}/{name}", repo.bucket_name());
            }
            println!(
                "\n✅ Exported {} files to gs://{}",
                uploaded.len(),
                repo.bucket_name()
            );
        }
    }

    Ok(())
}

async fn up(
    gke: Arc<Gke>,
    config: LifecycleConfig,
    plan: GpuClusterPlan,
    workloads: Workloads,
    keep: bool,
) -> Result<()> {
    let manager = Manager::with_workloads(gke.clone(), gke.clone(), config);
    let signals = manager.abort_on_signal();
    let driver_timeout = manager.config().deployment.create.timeout;

    info!(cluster = %plan.cluster, pool = %plan.pool, keep, "Bringing up GPU cluster");
    let pool_spec = plan.pool_spec();
    let result = manager
        .manage(plan.cluster_spec())
        .keep(keep)
        .run(|cluster| async move {
            cluster
                .attach(pool_spec)
                .keep(keep)
                .run(|pool| async move {
                    let handle = cluster
                        .remote_handle()
                        .context("Cluster has no remote handle")?;
                    println!("\n✅ Cluster {} is running", cluster.name());
                    println!("   GPU pool: {}", pool.name());

                    if workloads.drivers {
                        gke.install_gpu_drivers(&handle, driver_timeout)
                            .await
                            .context("Failed to install NVIDIA drivers")?;
                        println!("   🎮 NVIDIA drivers installed");
                    }

                    for path in &workloads.manifests {
                        let manifest = manifest::from_file(path)?;
                        pool.deploy(&manifest).await?;
                        println!("   📦 Applied {}", path.display());
                    }

                    for (name, path) in &workloads.deployments {
                        let manifest = manifest::from_file(path)?;
                        pool.create_child(deployment_spec(name, &manifest, &workloads.namespace))
                            .await?;
                        println!("   🚀 Deployment {name} available");
                    }

                    if workloads.hold {
                        println!("\n⏳ Holding, press Ctrl-C to tear down");
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!(error = %e, "Failed to listen for Ctrl+C");
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                })
                .await
        })
        .await;

    if manager.is_aborted() {
        // The signal handler is tearing down; let it finish.
        let _ = signals.await;
    } else {
        signals.abort();
    }
    result?;

    if keep {
        println!("\n💡 Cluster kept. Run `gpu down --cluster {}` to delete it", plan.cluster);
    } else {
        println!("\n✅ Cluster {} torn down", plan.cluster);
    }
    Ok(())
}

fn parse_deployment(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=FILE, got '{value}'"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=FILE, got '{value}'"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn status_emoji(status: &str) -> &'static str {
    match live_status(status, None) {
        LiveStatus::Running => "🟢",
        LiveStatus::Provisioning => "🟡",
        LiveStatus::Stopping => "🟠",
        LiveStatus::Error(_) => "🔴",
        LiveStatus::Gone => "⚪",
    }
}
