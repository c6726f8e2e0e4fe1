//! `dbbat-proxy`: terminates client connections, authenticates them against
//! the metadata store, and brokers a time-bounded, policy-controlled upstream
//! session per the resolved grant.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dbbat_audit::{AuditEvent, AuditLogger, AuditSink};
use dbbat_crypto::PasswordVerifyCache;
use dbbat_store::{PgStore, Store};

use dbbat_proxy::config::{self, ProxyConfig};
use dbbat_proxy::error::log_error;
use dbbat_proxy::listener::Listener;
use dbbat_proxy::session::SessionContext;
use dbbat_proxy::upstream::UpstreamDialer;
use dbbat_proxy::capture;

/// How long a client password verification is trusted once computed, before
/// [`PasswordVerifyCache`] re-runs Argon2id against the stored hash.
const PASSWORD_CACHE_TTL: Duration = Duration::from_secs(60);

/// Forwards every audit event straight to the metadata store. A write
/// failure is logged and dropped; the audit path never blocks a session on
/// store trouble.
struct StoreAuditSink {
    store: Arc<dyn Store>,
}

#[async_trait::async_trait]
impl AuditSink for StoreAuditSink {
    async fn write(&self, event: AuditEvent) {
        if let Err(err) = self.store.log_audit_event(event).await {
            log_error(err);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProxyConfig::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(identity = %config::proxy_identity(), listen_addr = %config.listen_addr, "starting up");

    let encryption_key = config.encryption_key()?;
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.storage_dsn).await?);

    let audit = Arc::new(AuditLogger::spawn(config.audit_queue_capacity, Arc::new(StoreAuditSink { store: store.clone() })));

    let storage_target = config::StorageTarget::from_dsn(&config.storage_dsn)?;
    let dialer = UpstreamDialer::new(storage_target);

    let ctx = Arc::new(SessionContext {
        store,
        audit,
        dialer,
        encryption_key,
        password_cache: PasswordVerifyCache::new(PASSWORD_CACHE_TTL),
        ceilings: capture::Ceilings { max_rows: config.max_result_rows, max_bytes: config.max_result_bytes },
        connect_timeout: config.connect_timeout(),
    });

    let listener = Listener::bind(ctx, config.listen_addr, config.max_connections).await?;
    listener.run().await?;

    Ok(())
}
