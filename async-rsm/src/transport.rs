//! The client transport interface.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::rpc::CommandRequest;
use crate::rpc::CommandResponse;
use crate::rpc::KeepAliveRequest;
use crate::rpc::KeepAliveResponse;
use crate::rpc::Publish;
use crate::rpc::QueryRequest;
use crate::rpc::QueryResponse;
use crate::rpc::RegisterRequest;
use crate::rpc::RegisterResponse;
use crate::AppData;
use crate::AppResponse;
use crate::NodeId;

/// A trait defining how the client session runtime reaches cluster members.
///
/// Wire encoding, connection establishment and authentication are all the
/// implementation's business; the session runtime only dials members and
/// exchanges the request/response shapes of this crate.
#[async_trait]
pub trait SessionTransport<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppResponse,
{
    /// The connection type produced by this transport.
    type Conn: Connection<D, R>;

    /// Open a connection to the given member.
    ///
    /// `publishes` is where the implementation delivers `Publish` frames
    /// the server pushes over this connection. The client holds one live
    /// connection at a time: dropping a `Conn` closes it.
    async fn connect(&self, member: NodeId, publishes: mpsc::UnboundedSender<Publish<D>>) -> Result<Self::Conn>;
}

/// A single established connection to one cluster member.
///
/// Errors returned from these methods are connection-level failures; the
/// session runtime classifies them as transport faults and retries against
/// another member. Application-level outcomes travel inside the response
/// shapes.
#[async_trait]
pub trait Connection<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppResponse,
{
    /// Send a session registration request.
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse>;

    /// Send a session keep-alive request.
    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<KeepAliveResponse>;

    /// Send an application command.
    async fn command(&self, req: CommandRequest<D>) -> Result<CommandResponse<R>>;

    /// Send an application query.
    async fn query(&self, req: QueryRequest<D>) -> Result<QueryResponse<R>>;
}
