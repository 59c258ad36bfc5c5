use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use classroom_safety_core::classifier::Classifier;
use classroom_safety_core::db::{
    self, init_db, seed, PgActivityStore, PgAlertSink, PgDirectory, PgSafetyStore,
};
use classroom_safety_core::ledger::ReviewDecision;
use classroom_safety_core::lexicon::Lexicon;
use classroom_safety_core::models::{IncidentReport, IncidentType, Severity};
use classroom_safety_core::orchestrator::SafetyOrchestrator;
use classroom_safety_core::report;
use classroom_safety_core::store::{ActivityStore, AlertSink, Directory, SafetyStore};
use classroom_safety_core::IncidentLedger;

#[derive(Parser)]
#[command(name = "classroom-safety")]
#[command(about = "Child-safety incident core for the classroom gaming platform", long_about = None)]
struct Cli {
    /// Optional JSON phrase-table file overriding the built-in lexicon
    #[arg(long, global = true)]
    lexicon: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import progress records from a CSV file
    ImportProgress {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record a manual incident report against a student
    ReportIncident {
        #[arg(long)]
        offender: Uuid,
        #[arg(long)]
        victim: Uuid,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "medium")]
        severity: String,
    },
    /// Classify a message and record an incident if it is flagged
    CheckMessage {
        #[arg(long)]
        sender: Uuid,
        #[arg(long)]
        recipient: Uuid,
        #[arg(long)]
        content: String,
    },
    /// Mark a pending incident reviewed or dismissed
    Review {
        #[arg(long)]
        incident: Uuid,
        #[arg(long)]
        teacher: Uuid,
        #[arg(long)]
        notes: String,
        #[arg(long)]
        valid: bool,
    },
    /// Apply the consequence tier for an incident's offender
    ApplyConsequences {
        #[arg(long)]
        incident: Uuid,
        #[arg(long)]
        restriction_hours: Option<i64>,
    },
    /// Run the behavioral anomaly scan for one student
    ScanBehavior {
        #[arg(long)]
        student: Uuid,
    },
    /// Run the social co-presence scan for a classroom
    ScanSocial {
        #[arg(long)]
        classroom: Uuid,
        #[arg(long, default_value_t = 14)]
        window_days: i64,
    },
    /// Print a student's safety profile
    Profile {
        #[arg(long)]
        student: Uuid,
    },
    /// Print the safety dashboard for a classroom as JSON
    Dashboard {
        #[arg(long)]
        classroom: Uuid,
    },
    /// Generate a markdown safety report for a classroom
    Report {
        #[arg(long)]
        classroom: Uuid,
        #[arg(long, default_value = "safety-report.md")]
        out: PathBuf,
    },
}

fn orchestrator(pool: &PgPool, lexicon: Lexicon) -> SafetyOrchestrator {
    let store: Arc<dyn SafetyStore> = Arc::new(PgSafetyStore::new(pool.clone()));
    let activity: Arc<dyn ActivityStore> = Arc::new(PgActivityStore::new(pool.clone()));
    let directory: Arc<dyn Directory> = Arc::new(PgDirectory::new(pool.clone()));
    let alerts: Arc<dyn AlertSink> = Arc::new(PgAlertSink::new(pool.clone()));
    let ledger = IncidentLedger::new(Arc::clone(&store), alerts, Arc::clone(&directory));
    SafetyOrchestrator::new(
        Classifier::new(lexicon),
        ledger,
        store,
        activity,
        directory,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let lexicon = match &cli.lexicon {
        Some(path) => Lexicon::from_file(path)?,
        None => Lexicon::builtin(),
    };

    match cli.command {
        Commands::InitDb => {
            init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportProgress { csv } => {
            let inserted = db::import_progress_csv(&pool, &csv).await?;
            println!("Inserted {inserted} progress records from {}.", csv.display());
        }
        Commands::ReportIncident {
            offender,
            victim,
            description,
            severity,
        } => {
            let severity = Severity::parse(&severity)
                .with_context(|| format!("unknown severity '{severity}'"))?;
            let core = orchestrator(&pool, lexicon);
            let incident = core
                .ledger()
                .report_incident(IncidentReport {
                    reported_student_id: offender,
                    victim_student_id: victim,
                    incident_type: IncidentType::ManualReport,
                    description,
                    flagged_content: None,
                    severity,
                    flag_reasons: Vec::new(),
                })
                .await?;
            println!(
                "Recorded incident {} (violation count {}).",
                incident.id, incident.violation_count_at_report
            );
        }
        Commands::CheckMessage {
            sender,
            recipient,
            content,
        } => {
            let core = orchestrator(&pool, lexicon);
            let result = core.check_message(sender, recipient, &content).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Review {
            incident,
            teacher,
            notes,
            valid,
        } => {
            let core = orchestrator(&pool, lexicon);
            let decision = if valid {
                ReviewDecision::Valid
            } else {
                ReviewDecision::Invalid
            };
            let reviewed = core
                .ledger()
                .review_incident(incident, teacher, notes, decision)
                .await?;
            println!(
                "Incident {} is now {}.",
                reviewed.id,
                reviewed.status.as_str()
            );
        }
        Commands::ApplyConsequences {
            incident,
            restriction_hours,
        } => {
            let core = orchestrator(&pool, lexicon);
            let ends_at =
                restriction_hours.map(|h| chrono::Utc::now() + chrono::Duration::hours(h));
            let (resolved, log) = core
                .ledger()
                .apply_consequences(incident, &[], ends_at)
                .await?;
            println!(
                "Applied to {} (violation {} -> status {}):",
                resolved.reported_student_id,
                log.violation_count,
                log.status.as_str()
            );
            for consequence in &resolved.applied_consequences {
                println!("- {consequence}");
            }
        }
        Commands::ScanBehavior { student } => {
            let core = orchestrator(&pool, lexicon);
            let anomalies = core.run_behavioral_scan(student).await?;
            if anomalies.is_empty() {
                println!("No behavioral anomalies found.");
            }
            for anomaly in anomalies {
                println!(
                    "- [{}] {}: {}",
                    anomaly.severity,
                    anomaly.anomaly_type.as_str(),
                    anomaly.description
                );
            }
        }
        Commands::ScanSocial {
            classroom,
            window_days,
        } => {
            let core = orchestrator(&pool, lexicon);
            let anomalies = core.run_social_scan(classroom, window_days).await?;
            if anomalies.is_empty() {
                println!("No social anomalies found.");
            }
            for anomaly in anomalies {
                println!(
                    "- [{}] {} targeting {}: {}",
                    anomaly.severity,
                    anomaly.anomaly_type.as_str(),
                    anomaly.targeted_student,
                    anomaly.description
                );
            }
        }
        Commands::Profile { student } => {
            let core = orchestrator(&pool, lexicon);
            let profile = core.student_safety_profile(student).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Dashboard { classroom } => {
            let core = orchestrator(&pool, lexicon);
            let dashboard = core.teacher_dashboard(classroom).await?;
            println!("{}", serde_json::to_string_pretty(&dashboard)?);
        }
        Commands::Report { classroom, out } => {
            let core = orchestrator(&pool, lexicon);
            let dashboard = core.teacher_dashboard(classroom).await?;
            let report = report::build_report(&dashboard);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
