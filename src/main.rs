use std::sync::Arc;

use rust_decimal_macros::dec;
use support_agent::config::AgentConfig;
use support_agent::http::{routes, AppState};
use support_agent::knowledge::KnowledgeIndex;
use support_agent::llm::create_provider;
use support_agent::mailbox::{ImapMailbox, MailboxConfig, MailboxGateway};
use support_agent::pipeline::{spawn_account_poller, MessageProcessor};
use support_agent::store::{Database, LibSqlBackend, OrderRecord};

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

    let config = AgentConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export SUPPORT_GEMINI_API_KEY=...");
        std::process::exit(1);
    });

    eprintln!("Support Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   API:   http://0.0.0.0:{}", config.http_port);
    eprintln!("   Poll:  every {}s", config.pipeline.poll_interval_secs);

    let llm = create_provider(&config)?;

    // ── Database ────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
            std::process::exit(1);
        }),
    );
    eprintln!("   Database: {}", config.db_path);

    if config.seed_sample_orders {
        seed_sample_orders(&db).await;
    }

    // ── Knowledge base ──────────────────────────────────────────────
    let index = Arc::new(KnowledgeIndex::new(Arc::clone(&llm)));
    if let Some(path) = &config.knowledge_path {
        match index.load_from_file(path).await {
            Ok(n) => eprintln!("   Knowledge: {n} entries from {path}"),
            Err(e) => {
                eprintln!("Error: Failed to load knowledge from {path}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("   Knowledge: empty (SUPPORT_KNOWLEDGE_PATH not set)");
    }

    // ── Mailbox + pollers ───────────────────────────────────────────
    let Some(mailbox_config) = MailboxConfig::from_env() else {
        eprintln!("Error: SUPPORT_IMAP_HOST not set, no mailbox to poll");
        std::process::exit(1);
    };
    let account = mailbox_config.username.clone();
    let mailbox: Arc<dyn MailboxGateway> = Arc::new(ImapMailbox::new(mailbox_config));

    db.upsert_account(&account).await?;

    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&db),
        Arc::clone(&llm),
        Arc::clone(&index),
        mailbox,
        &config.pipeline,
    ));

    let active_accounts: Vec<String> = db
        .list_accounts()
        .await?
        .into_iter()
        .filter(|a| a.active)
        .map(|a| a.address)
        .collect();

    let mut poller_handles = Vec::new();
    for account in active_accounts {
        let handle = spawn_account_poller(
            account,
            Arc::clone(&processor),
            config.pipeline.poll_interval_secs,
        );
        poller_handles.push(handle);
    }

    // ── HTTP server ─────────────────────────────────────────────────
    let app = routes(AppState {
        db: Arc::clone(&db),
        processor,
        index,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down pollers");
    for (handle, shutdown) in poller_handles {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.abort();
    }

    Ok(())
}

/// Seed a few demo orders. Duplicate-key errors on restart are expected.
async fn seed_sample_orders(db: &Arc<dyn Database>) {
    let samples = [
        OrderRecord::new("ORD001", "customer1@example.com", dec!(99.99)),
        OrderRecord::new("ORD002", "customer2@example.com", dec!(149.50)),
        OrderRecord::new("ABC123", "customer3@example.com", dec!(29.99)),
    ];
    for order in samples {
        if db.insert_order(&order).await.is_ok() {
            eprintln!("   Seeded order {}", order.order_id);
        }
    }
}
