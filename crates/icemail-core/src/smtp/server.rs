//! SMTP server implementation

use anyhow::Result;
use icemail_common::config::SmtpConfig;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::{MessageHandler, SmtpHandler};

/// Inbound SMTP listener feeding a [`MessageHandler`]
pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    handler: Arc<dyn MessageHandler>,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(config: SmtpConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            config: Arc::new(config),
            handler,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("SMTP server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            let _ = stream
                                .write_all(b"421 4.3.2 Too many connections, try again later\r\n")
                                .await;
                            continue;
                        }
                    };

                    let handler = SmtpHandler::new(
                        self.config.clone(),
                        self.handler.clone(),
                        peer_addr.ip().to_string(),
                    );

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
