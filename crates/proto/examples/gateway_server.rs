//! A minimal Passage gateway: listens on port 2222, authenticates
//! against a fixed password, and runs shells/commands as local
//! children.
//!
//! Try it with a stock client:
//!
//! ```text
//! cargo run --example gateway_server
//! ssh -p 2222 alice@127.0.0.1 printf hello
//! ```

use passage_platform::{CredentialChecker, PassageResult};
use passage_proto::ssh::{Ed25519HostKey, ServerConfig, SshServer};
use std::sync::Arc;

struct DemoPassword;

#[async_trait::async_trait]
impl CredentialChecker for DemoPassword {
    async fn check_password(&self, user: &str, password: &str) -> PassageResult<bool> {
        Ok(user == "alice" && password == "demo")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = ServerConfig::new(Arc::new(Ed25519HostKey::generate()));
    config.credentials = Arc::new(DemoPassword);

    let server = Arc::new(SshServer::bind("127.0.0.1:2222", config).await?);
    tracing::info!(addr = %server.local_addr()?, "gateway listening");

    // SIGTERM/SIGINT: every connection gets DISCONNECT by-application
    tokio::spawn({
        let server = server.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            server.shutdown();
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            std::process::exit(0);
        }
    });

    loop {
        let session = server.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                tracing::debug!(error = %e, "session ended with error");
            }
        });
    }
}
