use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::handler::{handle_request, ProxyState};

pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, state: ProxyState) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);
        info!(
            addr = %self.local_addr()?,
            max_connections = self.state.max_connections(),
            "media proxy listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| handle_request(req, state.clone()));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }

        info!("media proxy stopped accepting connections");
        Ok(())
    }
}
