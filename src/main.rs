use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod classify;
mod csv_import;
mod db;
mod dedup;
mod error;
mod export;
mod graph;
mod models;
mod normalize;
mod reconcile;
mod report;
mod store;
mod sync;

use classify::{Thresholds, MAX_THRESHOLD_MINUTES};
use models::{AttendanceStatus, ReportFilter};
use reconcile::ReconcileSummary;

#[derive(Parser)]
#[command(name = "meeting-attendance")]
#[command(about = "Meeting attendance tracker with Teams sync and CSV import", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[command(flatten)]
    thresholds: ThresholdArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ThresholdArgs {
    /// Minutes after the scheduled start before a join counts as late
    #[arg(
        long,
        env = "LATE_AFTER_MINUTES",
        global = true,
        value_parser = clap::value_parser!(i64).range(0..=MAX_THRESHOLD_MINUTES)
    )]
    late_after_minutes: Option<i64>,
    /// Attendance shorter than this many minutes counts as partial
    #[arg(
        long,
        env = "MIN_ATTENDANCE_MINUTES",
        global = true,
        value_parser = clap::value_parser!(i64).range(0..=MAX_THRESHOLD_MINUTES)
    )]
    min_attendance_minutes: Option<i64>,
}

impl ThresholdArgs {
    fn apply(&self, preset: Thresholds) -> Thresholds {
        preset.with_overrides(self.late_after_minutes, self.min_attendance_minutes)
    }
}

fn range_start(value: &str) -> Result<DateTime<Utc>, String> {
    normalize::parse_range_start(value)
        .ok_or_else(|| format!("expected YYYY-MM-DD or an RFC 3339 timestamp, got {value:?}"))
}

fn range_end(value: &str) -> Result<DateTime<Utc>, String> {
    normalize::parse_range_end(value)
        .ok_or_else(|| format!("expected YYYY-MM-DD or an RFC 3339 timestamp, got {value:?}"))
}

#[derive(Args)]
struct GraphArgs {
    /// Delegated Graph access token of the signed-in user
    #[arg(long, env = "GRAPH_ACCESS_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long, env = "GRAPH_BASE_URL", default_value = graph::DEFAULT_BASE_URL)]
    graph_url: String,
    /// User id or UPN owning the meetings
    #[arg(long)]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo meeting with attendance
    Seed,
    /// Import attendance rows from an IT-supplied CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
        /// Reconcile against the database without writing to it
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Pull attendance reports for one Teams meeting
    SyncMeeting {
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(long)]
        meeting: String,
        #[arg(long)]
        json: bool,
    },
    /// Pull attendance for the user's recent online meetings
    SyncRecent {
        #[command(flatten)]
        graph: GraphArgs,
        #[arg(
            long,
            default_value_t = 7,
            value_parser = clap::value_parser!(i64).range(1..=sync::MAX_DAYS_BACK)
        )]
        days_back: i64,
        #[arg(long)]
        json: bool,
    },
    /// List students, optionally matching name, email or roster id
    Students {
        #[arg(long)]
        search: Option<String>,
    },
    /// List meetings, newest first
    Meetings {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Attendance counts for one meeting
    MeetingSummary {
        #[arg(long)]
        meeting: Uuid,
    },
    /// Attendance stats and recent records for one student
    StudentSummary {
        #[arg(long)]
        student: Uuid,
    },
    /// Generate a markdown attendance report
    #[command(group(
        ArgGroup::new("scope")
            .args(["meeting", "student"])
            .multiple(false)
    ))]
    Report {
        #[arg(long)]
        meeting: Option<Uuid>,
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long)]
        status: Option<AttendanceStatus>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        /// Only meetings ending by this date or timestamp
        #[arg(long, value_parser = range_end)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value = "attendance-report.md")]
        out: PathBuf,
    },
    /// Export filtered attendance records as CSV
    #[command(group(
        ArgGroup::new("scope")
            .args(["meeting", "student"])
            .multiple(false)
    ))]
    Export {
        #[arg(long)]
        meeting: Option<Uuid>,
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long)]
        status: Option<AttendanceStatus>,
        /// Only meetings starting at or after this date or timestamp
        #[arg(long, value_parser = range_start)]
        from: Option<DateTime<Utc>>,
        /// Only meetings ending by this date or timestamp
        #[arg(long, value_parser = range_end)]
        to: Option<DateTime<Utc>>,
        #[arg(long, default_value = "attendance-report.csv")]
        out: PathBuf,
    },
}

async fn connect(database_url: Option<&str>) -> anyhow::Result<PgPool> {
    let database_url = database_url.context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn print_summary(summary: &ReconcileSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "Created {} records, skipped {} duplicates ({} new meetings, {} new students).",
        summary.created, summary.skipped, summary.meetings_created, summary.students_created
    );
    if !summary.errors.is_empty() {
        println!("{} rows failed:", summary.errors.len());
        for error in summary.errors.iter() {
            println!("- {error}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meeting_attendance=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let database_url = cli.database_url.as_deref();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(database_url).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let store = db::PgStore::new(connect(database_url).await?);
            let summary = db::seed(&store).await?;
            print_summary(&summary, false)?;
        }
        Commands::Import { csv, dry_run, json } => {
            let thresholds = cli.thresholds.apply(Thresholds::csv_import());
            let store = db::PgStore::new(connect(database_url).await?);
            let summary = if dry_run {
                let preview = store::preview::PreviewStore::new(&store);
                csv_import::import_file(&preview, &csv, thresholds).await?
            } else {
                csv_import::import_file(&store, &csv, thresholds).await?
            };
            print_summary(&summary, json)?;
        }
        Commands::SyncMeeting {
            graph: graph_args,
            meeting,
            json,
        } => {
            let store = db::PgStore::new(connect(database_url).await?);
            let client = graph::GraphClient::new(&graph_args.graph_url, &graph_args.token)?;
            let thresholds = cli.thresholds.apply(Thresholds::live_sync());
            let summary =
                sync::sync_meeting(&store, &client, &graph_args.user, &meeting, thresholds).await?;
            print_summary(&summary, json)?;
        }
        Commands::SyncRecent {
            graph: graph_args,
            days_back,
            json,
        } => {
            let store = db::PgStore::new(connect(database_url).await?);
            let client = graph::GraphClient::new(&graph_args.graph_url, &graph_args.token)?;
            let thresholds = cli.thresholds.apply(Thresholds::live_sync());
            let result =
                sync::sync_recent(&store, &client, &graph_args.user, days_back, thresholds).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "Synced {} meetings ({} failed).",
                    result.meetings_found, result.meetings_failed
                );
                print_summary(&result.summary, false)?;
            }
        }
        Commands::Students { search } => {
            let pool = connect(database_url).await?;
            let students = match search.as_deref() {
                Some(term) => db::search_students(&pool, term).await?,
                None => db::list_students(&pool).await?,
            };
            if students.is_empty() {
                println!("No students found.");
            }
            for student in students.iter() {
                println!("- {} <{}> {}", student.name, student.email, student.id);
            }
        }
        Commands::Meetings { limit } => {
            let pool = connect(database_url).await?;
            let meetings = db::list_meetings(&pool, limit).await?;
            if meetings.is_empty() {
                println!("No meetings yet.");
            }
            for meeting in meetings.iter() {
                println!(
                    "- {} {} ({}) {}",
                    meeting.start_time.format("%Y-%m-%d %H:%M"),
                    meeting.title.as_deref().unwrap_or("Untitled meeting"),
                    meeting.external_id,
                    meeting.id
                );
            }
        }
        Commands::MeetingSummary { meeting } => {
            let pool = connect(database_url).await?;
            let summary = db::meeting_summary(&pool, meeting).await?;
            print!("{}", report::format_meeting_summary(&summary));
        }
        Commands::StudentSummary { student } => {
            let pool = connect(database_url).await?;
            let found = db::find_student(&pool, student)
                .await?
                .with_context(|| format!("student {student} not found"))?;
            let stats = db::student_stats(&pool, student).await?;
            let filter = ReportFilter {
                student_id: Some(student),
                ..ReportFilter::default()
            };
            let recent = db::fetch_attendance(&pool, &filter).await?;
            let label = format!("{} <{}>", found.name, found.email);
            print!("{}", report::format_student_summary(&label, &stats, &recent));
        }
        Commands::Report {
            meeting,
            student,
            status,
            since_days,
            to,
            out,
        } => {
            let pool = connect(database_url).await?;
            let since = report::cutoff(since_days);
            let filter = ReportFilter {
                student_id: student,
                meeting_id: meeting,
                start_date: Some(since),
                end_date: to,
                status,
            };
            let rows = db::fetch_attendance(&pool, &filter).await?;
            let scope = meeting
                .map(|id| format!("meeting {id}"))
                .or_else(|| student.map(|id| format!("student {id}")));
            let output = report::build_report(scope.as_deref(), since, &rows);
            std::fs::write(&out, output)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export {
            meeting,
            student,
            status,
            from,
            to,
            out,
        } => {
            let pool = connect(database_url).await?;
            let filter = ReportFilter {
                student_id: student,
                meeting_id: meeting,
                start_date: from,
                end_date: to,
                status,
            };
            let rows = db::fetch_attendance(&pool, &filter).await?;
            export::export_file(&out, &rows)?;
            println!("Exported {} records to {}.", rows.len(), out.display());
        }
    }

    Ok(())
}
