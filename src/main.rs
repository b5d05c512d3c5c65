use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod admin;
mod analytics;
mod auth;
mod config;
mod dashboard;
mod db;
mod error;
mod explain;
mod models;
mod recommend;
mod report;
mod routes;
mod state;
mod store;
mod tiers;
mod validation;

use config::Config;
use dashboard::{DashboardParams, Range, Slice, SliceStatus};
use explain::{AnthropicClient, LlmClient};
use state::AppState;
use store::Store;

#[derive(Parser)]
#[command(name = "elevenplus")]
#[command(about = "Practice analytics service for 11+ exam preparation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo accounts, questions and practice history
    Seed,
    /// Import practice attempts from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the HTTP API
    Serve,
    /// Generate a markdown progress report for one child
    Report {
        #[arg(long)]
        child_id: Uuid,
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Fetch a child's dashboard from a running server and print it
    Dashboard {
        #[arg(long, default_value = "http://localhost:8080")]
        base_url: String,
        #[arg(long, env = "ELEVENPLUS_TOKEN")]
        token: String,
        #[arg(long)]
        child_id: Uuid,
        #[arg(long, default_value = "30d")]
        range: Range,
        #[arg(long)]
        days: Option<i64>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

async fn connect() -> anyhow::Result<sqlx::PgPool> {
    let database_url = config::database_url()?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let accounts = db::seed(&pool).await?;
            println!("Seed data inserted.");
            println!(
                "Sign in as {} or {} with password {} (child {}).",
                accounts.admin_email, accounts.parent_email, accounts.password, accounts.child_id
            );
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} attempts from {}.", csv.display());
        }
        Commands::Serve => {
            let config = Config::load()?;
            let pool = connect().await?;
            db::init_db(&pool).await?;
            let llm: Option<Arc<dyn LlmClient>> = match config.llm.clone() {
                Some(llm) => {
                    info!(model = %llm.model, "explanation generation enabled");
                    Some(Arc::new(AnthropicClient::new(llm)?))
                }
                None => None,
            };
            let state = AppState::new(Arc::new(db::PgStore::new(pool)), llm, config);
            routes::serve(state).await?;
        }
        Commands::Report {
            child_id,
            days,
            out,
        } => {
            let store = db::PgStore::new(connect().await?);
            let child = store
                .find_child(child_id)
                .await?
                .with_context(|| format!("child {child_id} not found"))?;
            let window = analytics::Window::new(Utc::now(), days);
            let attempts = store.fetch_attempts(child.id, window.fetch_since()).await?;
            let history = store.practice_days(child.id, window.now).await?;
            let topics = store.count_curriculum_topics().await?;
            let report = report::build_report(&child, &window, &attempts, &history, topics);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Dashboard {
            base_url,
            token,
            child_id,
            range,
            days,
        } => {
            let params = DashboardParams {
                range,
                days,
                ..DashboardParams::new(child_id)
            };
            let view = dashboard::load_once(&base_url, &token, params).await?;

            println!("Dashboard for child {child_id} ({} days):", params.effective_days());
            for slice in Slice::ALL {
                let status = match view.status_of(slice) {
                    Some(SliceStatus::Loaded) => "loaded".to_string(),
                    Some(SliceStatus::Locked) => "locked".to_string(),
                    Some(SliceStatus::Failed(reason)) => format!("failed: {reason}"),
                    None => "not fetched".to_string(),
                };
                println!("- {}: {status}", slice.path());
            }
            if let Some(readiness) = &view.readiness {
                println!(
                    "Readiness {}/100 ({})",
                    readiness.overall_score,
                    readiness.tier_badge.label
                );
            }
            let focus_areas = view.focus_areas();
            if !focus_areas.is_empty() {
                println!("Focus areas:");
                for area in focus_areas {
                    println!(
                        "- {} / {}: {:.1}% [{:?}]",
                        area.subject.replace('_', " "),
                        area.topic,
                        area.accuracy,
                        area.priority
                    );
                }
            }
            let recommendations = view.recommendations();
            if !recommendations.is_empty() {
                println!("Recommendations:");
                for recommendation in recommendations {
                    println!("- [{:?}] {}", recommendation.priority, recommendation.message);
                }
            }
        }
    }

    Ok(())
}
