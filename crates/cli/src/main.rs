use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use orka_apply::{CrdDefinition, CrdRegistrar, DesiredSet, Owner, Plan, PlanAction};
use orka_core::{Gvk, ObjectKey, ResourceCache, ResourceClient};
use orka_kubehub::KubeResourceClient;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "orkactl", version, about = "Apply desired sets of Kubernetes records")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced records that do not name one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct SetArgs {
    /// Identifier of the desired set
    #[arg(long = "set-id", env = "ORKA_SET_ID", default_value = "")]
    set_id: String,

    /// Owner record, e.g. "apps/v1/Deployment:ns/name"
    #[arg(long = "owner")]
    owner: Option<String>,

    /// Also set an ownerReference to the owner (controller=true)
    #[arg(long = "owner-ref", action = ArgAction::SetTrue)]
    owner_ref: bool,

    /// Restrict discovery and placement to these namespaces
    #[arg(long = "listing-ns")]
    listing_namespaces: Vec<String>,

    /// Types pruned even when the set holds none of them, e.g. "v1/Secret"
    #[arg(long = "prune-type")]
    prune_types: Vec<String>,

    /// Never delete records
    #[arg(long = "no-delete", action = ArgAction::SetTrue)]
    no_delete: bool,

    /// Patch two-way from the live state
    #[arg(long = "fast-apply", action = ArgAction::SetTrue)]
    fast_apply: bool,

    /// Field paths whose removals survive under --fast-apply, e.g. "spec.template"
    #[arg(long = "replace-field")]
    replace_fields: Vec<String>,

    /// Ignore the recorded last-applied state
    #[arg(long = "ignore-previous-applied", action = ArgAction::SetTrue)]
    ignore_previous_applied: bool,

    /// Reject cluster-scoped records
    #[arg(long = "restrict-cluster-scoped", action = ArgAction::SetTrue)]
    restrict_cluster_scoped: bool,

    /// Client calls per second (0 = unlimited)
    #[arg(long = "rate", env = "ORKA_APPLY_RATE", default_value_t = 0.0)]
    rate: f64,

    /// Watch prune types into a cache and read from it
    #[arg(long = "strict-cache", action = ArgAction::SetTrue)]
    strict_cache: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make the cluster match the manifests
    Apply {
        /// Manifest file or directory
        path: PathBuf,
        #[command(flatten)]
        set: SetArgs,
        /// Print the plan instead of writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show what apply would do, including patch bodies
    Plan {
        path: PathBuf,
        #[command(flatten)]
        set: SetArgs,
    },
    /// Register CRDs and wait until they are established
    Crds {
        /// GVK keys of the custom types, e.g. "example.io/v1/Widget"
        #[arg(required = true)]
        kinds: Vec<String>,
        #[arg(long = "cluster-scoped", action = ArgAction::SetTrue)]
        cluster_scoped: bool,
        /// Enable the status subresource
        #[arg(long = "status", action = ArgAction::SetTrue)]
        status: bool,
    },
    /// Delete a managed record whose owner is gone
    PurgeOrphan {
        /// GVK key of the record
        gvk: String,
        /// "ns/name" or "name"
        key: String,
        #[command(flatten)]
        set: SetArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("ORKA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORKA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ORKA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Ctrl-C cancels in-flight work.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            t.cancel();
        }
    });
    token
}

fn parse_owner(s: &str) -> Result<(Gvk, ObjectKey)> {
    let (gvk, key) = s.split_once(':').ok_or_else(|| anyhow!("owner must look like <gvk>:<ns/name>, got {}", s))?;
    Ok((Gvk::parse_key(gvk)?, ObjectKey::parse(key)))
}

async fn build_set(
    client: &Arc<KubeResourceClient>,
    args: &SetArgs,
    namespace: Option<&str>,
    cancel: &CancellationToken,
) -> Result<DesiredSet> {
    let dyn_client: Arc<dyn ResourceClient> = client.clone();
    let mut ds = DesiredSet::new(dyn_client.clone())
        .with_set_id(args.set_id.clone())
        .with_listing_namespaces(args.listing_namespaces.iter().cloned())
        .with_no_delete(args.no_delete)
        .with_ignore_previous_applied(args.ignore_previous_applied)
        .with_restrict_cluster_scoped(args.restrict_cluster_scoped)
        .with_rate_limit(args.rate)
        .with_cancellation(cancel.clone());
    if let Some(ns) = namespace {
        ds = ds.with_default_namespace(ns);
    }
    if args.fast_apply {
        ds = ds.with_fast_apply(args.replace_fields.iter().cloned());
    }
    if let Some(spec) = &args.owner {
        let (gvk, key) = parse_owner(spec)?;
        let owner = match dyn_client.get(&gvk, &key).await {
            Ok(Some(live)) => Owner::of(&live)?,
            Ok(None) => {
                warn!(owner = %spec, "owner not found; recording it without a uid");
                Owner::new(gvk, key)
            }
            Err(e) => return Err(e).with_context(|| format!("fetching owner {}", spec)),
        };
        ds = ds.with_owner(owner);
        if args.owner_ref {
            ds = ds.with_owner_reference(true, true);
        }
    }
    let prune_types = args.prune_types.iter().map(|k| Gvk::parse_key(k)).collect::<Result<Vec<_>, _>>()?;
    ds = ds.with_prune_types(prune_types.iter().cloned());
    if args.strict_cache {
        let cap = std::env::var("ORKA_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        let wait_secs = std::env::var("ORKA_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
        for gvk in prune_types {
            let (tx, cache) = orka_store::spawn_ingest(cap);
            let watch_client = client.clone();
            let watch_gvk = gvk.clone();
            tokio::spawn(async move {
                if let Err(e) = orka_kubehub::watch_deltas(&watch_client, &watch_gvk, None, tx).await {
                    error!(gvk = %watch_gvk.key(), error = ?e, "watcher failed");
                }
            });
            if !cache.wait_synced(Duration::from_secs(wait_secs)).await {
                warn!(gvk = %gvk.key(), "cache not synced; reads may be stale");
            }
            let cache: Arc<dyn ResourceCache> = Arc::new(cache);
            ds = ds.with_cache(gvk, cache);
        }
        ds = ds.with_strict_caching(true);
    }
    Ok(ds)
}

fn print_plan(plan: &Plan, output: Output, verbose: bool) -> Result<()> {
    match output {
        Output::Json => {
            if verbose {
                println!("{}", serde_json::to_string_pretty(plan)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&plan.summary())?);
            }
        }
        Output::Human => {
            for entry in plan.entries() {
                match &entry.action {
                    PlanAction::Create { .. } => println!("+ {}", entry.key),
                    PlanAction::Update { patch } => {
                        println!("~ {}", entry.key);
                        if verbose {
                            println!("    {}", patch);
                        }
                    }
                    PlanAction::Delete => println!("- {}", entry.key),
                }
            }
            let s = plan.summary();
            println!("{} to create, {} to update, {} to delete", s.creates, s.updates, s.deletes);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Apply { path, set, dry_run } => {
            let objs = orka_apply::manifest::load_path(&path)?;
            info!(path = %path.display(), records = objs.len(), dry_run, "apply invoked");
            let client = Arc::new(KubeResourceClient::try_default().await?);
            let ds = build_set(&client, &set, cli.namespace.as_deref(), &cancel).await?;
            if dry_run {
                let plan = ds.dry_run_set(objs).await?;
                print_plan(&plan, cli.output, false)?;
            } else {
                ds.apply(objs).await?;
                match cli.output {
                    Output::Human => println!("applied"),
                    Output::Json => println!("{}", serde_json::json!({"applied": true})),
                }
            }
        }
        Commands::Plan { path, set } => {
            let objs = orka_apply::manifest::load_path(&path)?;
            info!(path = %path.display(), records = objs.len(), "plan invoked");
            let client = Arc::new(KubeResourceClient::try_default().await?);
            let ds = build_set(&client, &set, cli.namespace.as_deref(), &cancel).await?;
            let plan = ds.dry_run_set(objs).await?;
            print_plan(&plan, cli.output, true)?;
        }
        Commands::Crds { kinds, cluster_scoped, status } => {
            let mut crds = Vec::with_capacity(kinds.len());
            for k in &kinds {
                let gvk = Gvk::parse_key(k)?;
                let mut crd = CrdDefinition::new(&gvk.group, &gvk.version, &gvk.kind);
                if cluster_scoped {
                    crd = crd.cluster_scoped();
                }
                if status {
                    crd = crd.with_status();
                }
                crds.push(crd);
            }
            info!(count = crds.len(), "crds invoked");
            let client: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::try_default().await?);
            CrdRegistrar::new(client).with_cancellation(cancel.clone()).spawn_batch(crds.clone()).await??;
            match cli.output {
                Output::Human => crds.iter().for_each(|c| println!("{} established", c.name())),
                Output::Json => {
                    let names: Vec<String> = crds.iter().map(CrdDefinition::name).collect();
                    println!("{}", serde_json::to_string_pretty(&names)?);
                }
            }
        }
        Commands::PurgeOrphan { gvk, key, set } => {
            let gvk = Gvk::parse_key(&gvk)?;
            let key = ObjectKey::parse(&key);
            let client = Arc::new(KubeResourceClient::try_default().await?);
            let Some(record) = client.get(&gvk, &key).await.with_context(|| format!("fetching {} {}", gvk.key(), key))? else {
                return Err(anyhow!("{} {} not found", gvk.key(), key));
            };
            let ds = build_set(&client, &set, cli.namespace.as_deref(), &cancel).await?;
            let purged = ds.purge_orphan(&gvk, &record).await?;
            match cli.output {
                Output::Human => println!("{}", if purged { "purged" } else { "kept" }),
                Output::Json => println!("{}", serde_json::json!({"purged": purged})),
            }
        }
    }
    Ok(())
}
