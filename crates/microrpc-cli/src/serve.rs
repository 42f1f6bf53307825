use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use microrpc_common::protocol::{Result as RpcResult, SERVICE_HEADER};
use microrpc_common::transport::{Server, ServerStream};
use microrpc_resolver::{FileResolver, Route};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Settings for [`run`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub service: String,
    pub bind: String,
    /// Routes file to register in while serving.
    pub routes_file: Option<PathBuf>,
    /// Address written to the routes file. Defaults to the bound address.
    pub advertise: Option<String>,
}

/// Writes every received message straight back until the caller finishes.
pub async fn echo(mut stream: ServerStream) -> RpcResult<()> {
    debug!(
        method = %stream.method(),
        service = stream.headers().get(SERVICE_HEADER).unwrap_or(""),
        "echo stream"
    );
    while let Some(payload) = stream.recv().await? {
        stream.send(payload).await?;
    }
    Ok(())
}

/// Binds a server running [`echo`], calls `on_ready` with the bound address,
/// then serves until `shutdown` is cancelled. The route registered in
/// `routes_file` is removed again on the way out.
pub async fn run<F>(opts: ServeOptions, shutdown: CancellationToken, on_ready: F) -> Result<()>
where
    F: FnOnce(SocketAddr),
{
    let server = Server::bind(&opts.bind).await?;
    let local_addr = server.local_addr()?;
    let advertise = opts
        .advertise
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    let registration = match &opts.routes_file {
        Some(path) => Some(
            FileResolver::open(path, vec![Route::new(&opts.service, &advertise)]).await?,
        ),
        None => None,
    };

    info!(service = %opts.service, address = %advertise, "serving");
    on_ready(local_addr);

    let served = server.serve_with_shutdown(echo, shutdown).await;

    if let Some(resolver) = registration {
        resolver.deregister_self().await?;
        info!(service = %opts.service, "deregistered");
    }
    served?;
    Ok(())
}
