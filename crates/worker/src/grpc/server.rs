//! Worker gRPC server

use crate::service::GenerationService;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tokenrelay_common::{RelayError, Result};
use tokenrelay_proto::ModelServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

/// Worker gRPC server
pub struct WorkerServer {
    addr: SocketAddr,
}

impl WorkerServer {
    /// Create a server for `bind_address:port`
    pub fn new(bind_address: &str, port: u16) -> Result<Self> {
        let ip: IpAddr = bind_address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e| {
                RelayError::config(format!("Invalid bind address {}: {}", bind_address, e))
            })?;

        Ok(Self {
            addr: SocketAddr::new(ip, port),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(&self, service: GenerationService, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!("Worker gRPC server listening on {}", self.addr);

        Server::builder()
            .add_service(ModelServiceServer::new(service))
            .serve_with_shutdown(self.addr, shutdown)
            .await?;

        info!("Worker gRPC server stopped");
        Ok(())
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_with_listener<F>(
        listener: TcpListener,
        service: GenerationService,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!("Worker gRPC server listening on {}", listener.local_addr()?);

        Server::builder()
            .add_service(ModelServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        Ok(())
    }
}
