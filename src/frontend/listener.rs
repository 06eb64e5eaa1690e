//! Frontend listener implementation.
//!
//! Accepts client connections and admits each one as a session through the
//! frontend's plugin server.

use crate::balancer::{PluginServer, SessionParameter};
use crate::config::FrontendConfig;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

/// Frontend listener that accepts and admits connections.
pub struct FrontendListener {
    config: FrontendConfig,
    server: PluginServer,
    listener: TcpListener,
}

impl FrontendListener {
    /// Bind the frontend's listen address.
    pub async fn bind(config: FrontendConfig, server: PluginServer) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(
            name = %config.name,
            listen = %config.listen,
            pool = %config.pool,
            "frontend listener bound"
        );

        Ok(Self {
            config,
            server,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Accept connections until shutdown.
    #[instrument(skip_all, fields(frontend = %self.config.name))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    /// Admit one connection on its own task. The client id is the peer
    /// address. Connection metrics are kept by the relay.
    fn admit(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let frontend = self.config.name.clone();
        let server = self.server.clone();

        tokio::spawn(async move {
            let client = client_addr.to_string();
            let param = SessionParameter::with_downstream(client.clone(), stream);
            match server.new_session(param).await {
                Ok(sessions) => {
                    info!(
                        frontend = %frontend,
                        client = %client,
                        plugins = sessions.len(),
                        "client admitted"
                    );
                }
                Err(e) => {
                    warn!(frontend = %frontend, client = %client, error = %e, "client rejected");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frontend_listener_bind() {
        let config = FrontendConfig {
            name: "rtsp".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            pool: "media".to_string(),
            connect_timeout: Duration::from_secs(1),
        };

        let listener = FrontendListener::bind(config, PluginServer::new("rtsp"))
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.name(), "rtsp");
    }
}
