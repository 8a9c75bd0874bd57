use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ordo_core::{claim_name, resolve, simulate, GroupState, Ordinal, ScaleStep};
use ordo_kubehub::Settings;
use ordo_ops::{kube_guard, reconcile_once, KubeClaims, KubeGroups, PassOutcome};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ordoctl", version, about = "Ordo CLI: one-step ordinal scaling and deferred claim cleanup")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, env = "ORDO_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct Target {
    /// Target replica count
    #[arg(long = "replicas")]
    replicas: u32,
    /// Target delete slots, comma separated (e.g. 1,3)
    #[arg(long = "delete-slots", value_delimiter = ',')]
    delete_slots: Vec<Ordinal>,
}

impl Target {
    fn state(&self) -> GroupState {
        GroupState::new(self.replicas, self.delete_slots.iter().copied())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the live ordinals for a replica count and delete slots
    Resolve {
        #[command(flatten)]
        group: Target,
    },
    /// Preview the steps from one configuration to another (offline)
    Plan {
        /// Current replica count
        #[arg(long = "from-replicas")]
        from_replicas: u32,
        /// Current delete slots, comma separated
        #[arg(long = "from-delete-slots", value_delimiter = ',')]
        from_delete_slots: Vec<Ordinal>,
        #[command(flatten)]
        to: Target,
    },
    /// Run reconciler passes against a live StatefulSet, one step per pass
    Step {
        /// StatefulSet name
        name: String,
        /// Member kind used in claim names (volume claim template name)
        #[arg(long = "member-kind")]
        member_kind: String,
        #[command(flatten)]
        to: Target,
        /// Maximum passes; the group is observed again before each one
        #[arg(long = "passes", default_value_t = 1)]
        passes: usize,
    },
    /// Delete deferred claims of the given ordinals if they are marked
    Reclaim {
        /// StatefulSet name
        name: String,
        #[arg(long = "member-kind")]
        member_kind: String,
        /// Ordinals, comma separated
        #[arg(long = "ordinal", value_delimiter = ',', required = true)]
        ordinals: Vec<Ordinal>,
    },
    /// Stamp the defer-delete marker on the claim of an ordinal
    Mark {
        /// StatefulSet name
        name: String,
        #[arg(long = "member-kind")]
        member_kind: String,
        #[arg(long = "ordinal")]
        ordinal: Ordinal,
    },
}

fn init_tracing() {
    let env = std::env::var("ORDO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORDO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ORDO_METRICS_ADDR; expected host:port");
        }
    }
}

fn fmt_set(s: &BTreeSet<Ordinal>) -> String {
    let parts: Vec<String> = s.iter().map(|o| o.to_string()).collect();
    format!("{{{}}}", parts.join(","))
}

fn fmt_step(step: &ScaleStep) -> String {
    format!(
        "{} ordinal={} replicas={} delete_slots={}",
        step.direction,
        step.ordinal_or_sentinel(),
        step.replicas,
        fmt_set(&step.delete_slots)
    )
}

fn print_pass(out: Output, pass: &PassOutcome) -> Result<()> {
    match out {
        Output::Human => {
            let reclaim = match &pass.reclaim {
                Some(r) => format!(" reclaim={}", serde_json::to_string(r)?),
                None => String::new(),
            };
            println!("{}{}", fmt_step(&pass.step), reclaim);
        }
        Output::Json => println!("{}", serde_json::to_string(pass)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Resolve { group } => {
            let live = resolve(group.replicas, &group.state().delete_slots);
            match cli.output {
                Output::Human => println!("{}", fmt_set(&live)),
                Output::Json => println!("{}", serde_json::to_string(&live)?),
            }
        }
        Commands::Plan { from_replicas, from_delete_slots, to } => {
            let actual = GroupState::new(from_replicas, from_delete_slots);
            let steps: Vec<ScaleStep> = simulate(actual, to.state()).collect();
            match cli.output {
                Output::Human => {
                    if steps.is_empty() {
                        println!("already at target");
                    }
                    for (i, s) in steps.iter().enumerate() {
                        println!("{}. {}", i + 1, fmt_step(s));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&steps)?),
            }
        }
        Commands::Step { name, member_kind, to, passes } => {
            let client = ordo_kubehub::get_kube_client().await?;
            let groups = KubeGroups::new(client.clone(), &cli.namespace, settings.clone());
            let guard = kube_guard(client, &cli.namespace, &settings);
            let desired = to.state();
            for pass in 0..passes.max(1) {
                let outcome = reconcile_once(&groups, &guard, &name, &member_kind, &desired)
                    .await
                    .with_context(|| format!("reconciling {}/{}", cli.namespace, name))?;
                print_pass(cli.output, &outcome)?;
                if !outcome.needs_another_pass() {
                    info!(group = %name, passes = pass, "group at target");
                    break;
                }
            }
        }
        Commands::Reclaim { name, member_kind, ordinals } => {
            let client = ordo_kubehub::get_kube_client().await?;
            let guard = kube_guard(client, &cli.namespace, &settings);
            let skipped = guard.reclaim_many(&name, &member_kind, ordinals.iter().copied()).await?;
            for (ordinal, reason) in skipped.iter() {
                warn!(group = %name, ordinal = *ordinal, reason = %reason, "claim kept");
            }
            match cli.output {
                Output::Human => {
                    for o in ordinals.iter().collect::<BTreeSet<_>>() {
                        let claim = claim_name(&member_kind, &name, *o);
                        match skipped.get(o) {
                            Some(reason) => println!("{}: skipped ({})", claim, reason),
                            None => println!("{}: deleted", claim),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&skipped)?),
            }
        }
        Commands::Mark { name, member_kind, ordinal } => {
            let client = ordo_kubehub::get_kube_client().await?;
            let claims = KubeClaims::new(client, &cli.namespace, settings.clone());
            let claim = claim_name(&member_kind, &name, ordinal);
            claims.mark_deferred(&claim).await?;
            match cli.output {
                Output::Human => println!("{}: marked", claim),
                Output::Json => println!("{}", serde_json::json!({ "claim": claim, "marked": true })),
            }
        }
    }
    Ok(())
}
