use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use pulsewarden::config::PulsewardenConfig;
use pulsewarden::incident::{Actor, Incident, IncidentStatus};
use pulsewarden::metrics::MetricSample;
use pulsewarden::notify::NotificationDispatcher;
use pulsewarden::Services;

#[derive(Parser)]
#[command(
    name = "pulsewarden",
    about = "Metric anomaly detection and incident escalation",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $PULSEWARDEN_CONFIG, then /etc/pulsewarden/pulsewarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + ingest workers + escalation sweep)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Evaluate one sample read from a JSON file
    Evaluate {
        #[arg(long)]
        file: PathBuf,
    },

    /// Manage threshold configurations
    Thresholds {
        #[command(subcommand)]
        action: ThresholdAction,
    },

    /// Inspect and triage anomalies
    Anomalies {
        #[command(subcommand)]
        action: AnomalyAction,
    },

    /// Inspect and drive incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },
}

#[derive(Subcommand)]
enum ThresholdAction {
    /// List global configurations, or one application's
    List {
        #[arg(long)]
        application_id: Option<Uuid>,
    },

    /// Create the global default for every metric type
    Seed,
}

#[derive(Subcommand)]
enum AnomalyAction {
    /// List active anomalies
    List {
        #[arg(long)]
        application_id: Option<Uuid>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    Ack {
        id: Uuid,
    },
    Investigate {
        id: Uuid,
    },
    Resolve {
        id: Uuid,
    },
    FalsePositive {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List active incidents
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show one incident by id or number (INC-000001)
    Show {
        incident: String,
    },

    /// Move an incident to a new status
    Status {
        incident: String,

        /// OPEN, ACKNOWLEDGED, INVESTIGATING, IDENTIFIED, MITIGATING, MONITORING, RESOLVED, CLOSED
        status: IncidentStatus,

        #[arg(long)]
        comment: Option<String>,

        #[arg(long)]
        user_id: Option<Uuid>,
    },

    /// Add a comment to the timeline
    Comment {
        incident: String,

        message: String,

        #[arg(long)]
        user_id: Option<Uuid>,
    },

    /// Print the timeline, oldest first
    Timeline {
        incident: String,
    },
}

fn init_tracing(config: &PulsewardenConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolve the config under a stderr subscriber scoped to the call, so load
/// warnings are visible before the configured subscriber exists.
fn load_config(explicit: Option<&std::path::Path>) -> Result<PulsewardenConfig> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || PulsewardenConfig::resolve(explicit))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn find_incident(services: &Services, key: &str) -> Result<Incident> {
    let incident = match key.parse::<Uuid>() {
        Ok(id) => services.incidents.get(id)?,
        Err(_) => services.incidents.get_by_number(key)?,
    };
    Ok(incident)
}

fn print_incident_row(i: &Incident) {
    println!(
        "{:<12} | {:<5} | {:<2} | {:<13} | {}",
        i.incident_number, i.severity, i.priority, i.status, i.title
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting pulsewarden daemon");
            pulsewarden::serve(config).await?;
        }
        Commands::Evaluate { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read sample file {}", file.display()))?;
            let sample: MetricSample = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse sample file {}", file.display()))?;
            let services = Services::open(&config, NotificationDispatcher::disabled())?;
            let evaluation = services.engine.evaluate(sample.clone()).await?;
            services.history.record(&sample)?;

            if cli.json {
                print_json(&evaluation)?;
            } else {
                println!("Outcome: {:?}", evaluation.outcome);
                for r in &evaluation.results {
                    let flag = match r.severity {
                        Some(s) if r.anomaly_detected => s.to_string(),
                        _ => "ok".to_string(),
                    };
                    println!("{:<15} | {:<8} | {}", r.detection_type, flag, r.description);
                }
                for i in &evaluation.incidents {
                    println!("Opened {} ({}): {}", i.incident_number, i.severity, i.title);
                }
            }
        }
        Commands::Thresholds { action } => {
            let services = Services::open(&config, NotificationDispatcher::disabled())?;
            let configs = match action {
                ThresholdAction::List { application_id: Some(app) } => {
                    services.thresholds.list_for_application(app)?
                }
                ThresholdAction::List { application_id: None } => services.thresholds.list_global()?,
                ThresholdAction::Seed => services.thresholds.seed_defaults()?,
            };
            if cli.json {
                print_json(&configs)?;
            } else {
                println!(
                    "{:<22} | {:<8} | {:<8} | {:<7} | Enabled",
                    "Metric", "Warning", "Critical", "Z"
                );
                for c in &configs {
                    let fmt = |v: Option<f64>| v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".into());
                    println!(
                        "{:<22} | {:<8} | {:<8} | {:<7.2} | {}",
                        c.metric_type,
                        fmt(c.warning_threshold),
                        fmt(c.critical_threshold),
                        c.z_score_threshold,
                        c.enabled
                    );
                }
            }
        }
        Commands::Anomalies { action } => {
            let services = Services::open(&config, NotificationDispatcher::disabled())?;
            let recorder = &services.anomalies;
            let anomalies = match action {
                AnomalyAction::List { application_id: Some(app), limit } => {
                    recorder.list_by_application(app, None, limit)?
                }
                AnomalyAction::List { application_id: None, limit } => recorder.list_active(limit)?,
                AnomalyAction::Ack { id } => vec![recorder.acknowledge(id)?],
                AnomalyAction::Investigate { id } => vec![recorder.investigate(id)?],
                AnomalyAction::Resolve { id } => vec![recorder.resolve(id)?],
                AnomalyAction::FalsePositive { id } => vec![recorder.mark_false_positive(id)?],
            };
            if cli.json {
                print_json(&anomalies)?;
            } else {
                for a in &anomalies {
                    println!(
                        "{} | {:<8} | {:<13} | {:<15} | {}",
                        a.id, a.severity, a.status, a.metric_type, a.description
                    );
                }
            }
        }
        Commands::Incidents { action } => {
            let services = Services::open(&config, NotificationDispatcher::disabled())?;
            match action {
                IncidentAction::List { limit } => {
                    let incidents = services.incidents.list_active(limit)?;
                    if cli.json {
                        print_json(&incidents)?;
                    } else {
                        incidents.iter().for_each(print_incident_row);
                    }
                }
                IncidentAction::Show { incident } => {
                    let incident = find_incident(&services, &incident)?;
                    if cli.json {
                        print_json(&incident)?;
                    } else {
                        print_incident_row(&incident);
                        if let Some(d) = &incident.description {
                            println!("\n{d}");
                        }
                    }
                }
                IncidentAction::Status {
                    incident,
                    status,
                    comment,
                    user_id,
                } => {
                    let current = find_incident(&services, &incident)?;
                    let actor = Actor::from_parts(user_id, None);
                    let updated = services
                        .incidents
                        .update_status(current.id, status, &actor, comment)?;
                    if cli.json {
                        print_json(&updated)?;
                    } else {
                        print_incident_row(&updated);
                    }
                }
                IncidentAction::Comment {
                    incident,
                    message,
                    user_id,
                } => {
                    let current = find_incident(&services, &incident)?;
                    let actor = Actor::from_parts(user_id, None);
                    let entry = services.incidents.add_comment(current.id, &message, &actor)?;
                    if cli.json {
                        print_json(&entry)?;
                    } else {
                        println!("{} | {} | {}", entry.created_at.to_rfc3339(), entry.entry_type, entry.message);
                    }
                }
                IncidentAction::Timeline { incident } => {
                    let current = find_incident(&services, &incident)?;
                    let entries = services.incidents.timeline(current.id)?;
                    if cli.json {
                        print_json(&entries)?;
                    } else {
                        for e in &entries {
                            println!("{} | {:<22} | {}", e.created_at.to_rfc3339(), e.entry_type, e.message);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
