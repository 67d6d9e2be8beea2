use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use outreach::ai::{provider_from_config, IntentClassifier, LlmClassifier, LlmComposer, ReplyComposer};
use outreach::config::Config;
use outreach::dispatch::Dispatcher;
use outreach::ingest::ResponseIngestor;
use outreach::limiter::{hour_bucket, RateLimiter};
use outreach::respond::ReplyEngine;
use outreach::scheduler::spawn_jobs;
use outreach::stats;
use outreach::store::{LibSqlStore, Store};
use outreach::transport::{MailTransport, SmtpImapTransport};

const USAGE: &str = "Usage: outreach <command>

Commands:
  dispatch   Run one dispatch cycle (send due sequence steps)
  ingest     Run one ingest cycle (poll inboxes for replies)
  respond    Run one classify-and-reply cycle
  serve      Run all cycles on their configured intervals
  stats      Print dashboard stats";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let command = match std::env::args().nth(1) {
        Some(command) => command,
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
                std::process::exit(1);
            }),
    );

    // Seed the rate limiter from this hour's persisted sends so a restart
    // cannot overshoot any inbox's budget.
    let limiter = Arc::new(RateLimiter::new());
    let now = Utc::now();
    for inbox in store.active_inboxes().await? {
        let sent = store.sent_count_since(inbox.id, hour_bucket(now)).await?;
        limiter.seed(inbox.id, sent.try_into().unwrap_or(u32::MAX), now);
    }

    let transport: Arc<dyn MailTransport> = Arc::new(SmtpImapTransport::new(config.mail_timeout));

    let provider = provider_from_config(&config)?;
    let classifier: Option<Arc<dyn IntentClassifier>> = provider.as_ref().map(|p| {
        Arc::new(LlmClassifier::new(Arc::clone(p), config.fact_sheet.clone()))
            as Arc<dyn IntentClassifier>
    });
    let composer: Option<Arc<dyn ReplyComposer>> = provider.as_ref().map(|p| {
        Arc::new(LlmComposer::new(Arc::clone(p), config.fact_sheet.clone()))
            as Arc<dyn ReplyComposer>
    });

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&limiter),
        config.timezone,
        config.send_start_hour,
        config.send_end_hour,
        config.default_max_per_hour,
    ));
    let ingestor = Arc::new(ResponseIngestor::new(
        Arc::clone(&store),
        Arc::clone(&transport),
    ));
    let engine = Arc::new(ReplyEngine::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&limiter),
        classifier,
        composer,
        config.auto_send_threshold,
        config.default_max_per_hour,
    ));

    match command.as_str() {
        "dispatch" => {
            let summary = dispatcher.run_cycle(Utc::now()).await?;
            println!("{summary:#?}");
        }
        "ingest" => {
            let summary = ingestor.run_cycle(Utc::now()).await?;
            println!("{summary:#?}");
        }
        "respond" => {
            let summary = engine.run_cycle(Utc::now()).await?;
            println!("{summary:#?}");
        }
        "serve" => {
            let handle = spawn_jobs(
                dispatcher,
                ingestor,
                engine,
                config.dispatch_interval,
                config.ingest_interval,
                config.respond_interval,
            );
            tokio::signal::ctrl_c().await?;
            handle.shutdown();
        }
        "stats" => {
            let stats = stats::dashboard_stats(&store, Utc::now()).await?;
            println!("Leads: {} total", stats.total_leads);
            for (status, count) in &stats.leads_by_status {
                println!("  {:>16}: {count}", status.as_str());
            }
            println!("Sent today: {}", stats.sent_today);
            println!("Responses:  {}", stats.total_responses);
            for report in &stats.campaigns {
                println!(
                    "Campaign {:?} [{}]: {} steps, {} enrolled ({} halted, {} completed), \
                     {} sent, {} responses ({:.1}% rate)",
                    report.campaign.name,
                    report.campaign.status.as_str(),
                    report.step_count,
                    report.enrolled,
                    report.halted,
                    report.completed,
                    report.sent,
                    report.responses,
                    report.response_rate * 100.0,
                );
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}
