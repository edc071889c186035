//! One-shot requests against a control server.

use std::path::PathBuf;

use clap::Subcommand;
use keel_net::{ConnectionError, ControlClient};
use keel_protocol::NodeKey;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::format::Output;

#[derive(Debug, Subcommand)]
pub enum Request {
    /// list managed nodes
    List {
        /// include pid, program and start time
        #[arg(long)]
        full: bool,
    },

    /// start a node process
    Start {
        grid: String,
        cluster: String,
        node: String,
    },

    /// stop a node process and reap it
    Stop {
        grid: String,
        cluster: String,
        node: String,
    },

    /// kill a node process without waiting for it
    Kill {
        grid: String,
        cluster: String,
        node: String,
    },

    /// list clusters with their committed versions
    Clusters,

    /// print the committed configuration of a cluster
    GetConfig { cluster_id: u32 },

    /// commit a file as the next configuration version of a cluster
    UpdateConfig { cluster_id: u32, file: PathBuf },

    /// total and free memory of the server host
    Mem,

    /// cpu count of the server host
    Cpu,

    /// disk totals for a directory on the server host
    Disk { dir: String },
}

/// Sends `request` and collects the reply.
pub async fn execute<S>(
    client: &mut ControlClient<S>,
    request: &Request,
) -> Result<Output, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let output = match request {
        Request::List { full } => Output::Nodes(client.list(*full).await?),
        Request::Start {
            grid,
            cluster,
            node,
        } => Output::Started(client.start(NodeKey::new(grid, cluster, node)).await?),
        Request::Stop {
            grid,
            cluster,
            node,
        } => {
            client.stop(NodeKey::new(grid, cluster, node)).await?;
            Output::Ok
        }
        Request::Kill {
            grid,
            cluster,
            node,
        } => {
            client.kill(NodeKey::new(grid, cluster, node)).await?;
            Output::Ok
        }
        Request::Clusters => Output::Clusters(client.clusters().await?),
        Request::GetConfig { cluster_id } => Output::Config(client.get_config(*cluster_id).await?),
        Request::UpdateConfig { cluster_id, file } => {
            let payload = tokio::fs::read(file).await?;
            let version = client.update_config(*cluster_id, &payload).await?;
            Output::Committed {
                cluster_id: *cluster_id,
                version,
            }
        }
        Request::Mem => Output::Mem(client.mem_info().await?),
        Request::Cpu => Output::Cpu(client.cpu_info().await?),
        Request::Disk { dir } => Output::Disk {
            dir: dir.clone(),
            info: client.disk_info(dir).await?,
        },
    };
    Ok(output)
}
