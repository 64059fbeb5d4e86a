use crate::amqp::configuration::ConnectionParameters;
use anyhow::Context;
use lapin::{ChannelState, ConnectionProperties};
use tokio::time::timeout;
use tracing::{debug, warn};

/// A pooled handle, as seen by the [`ChannelPool`](crate::pool::ChannelPool).
///
/// The pool only needs to know whether the handle is still usable; closing it is the
/// job of the [`ChannelFactory`] that created it.
pub trait PoolResource: Send + Sync + 'static {
    fn is_open(&self) -> bool;
}

/// `ChannelFactory` creates and disposes of the resources held by a
/// [`ChannelPool`](crate::pool::ChannelPool).
#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Resource: PoolResource;

    /// Open a new resource against the endpoint described by `params`.
    async fn create(&self, params: &ConnectionParameters) -> Result<Self::Resource, anyhow::Error>;

    /// Close `resource` and everything it owns.
    ///
    /// Errors are logged by the pool and otherwise ignored: the resource is gone either way.
    async fn destroy(&self, resource: Self::Resource) -> Result<(), anyhow::Error>;
}

/// A lapin channel together with the connection it was opened on.
///
/// Each `BrokerChannel` owns its connection: destroying the channel closes the connection.
pub struct BrokerChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

impl BrokerChannel {
    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }
}

impl PoolResource for BrokerChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
            && matches!(self.channel.status().state(), ChannelState::Connected)
    }
}

/// [`ChannelFactory`] opening one [`lapin::Connection`] per pooled channel.
#[derive(Clone, Default)]
pub struct LapinChannelFactory;

impl LapinChannelFactory {
    pub fn new() -> Self {
        Self
    }

    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match timeout(
            params.connection_timeout,
            lapin::Connection::connect_uri(params.amqp_uri(), properties),
        )
        .await
        {
            Ok(result) => result.with_context(|| {
                format!("Failed to connect to RabbitMQ at {}:{}.", params.host, params.port)
            }),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to connect to RabbitMQ at {}:{}.",
                params.host,
                params.port
            )),
        }
    }
}

#[async_trait::async_trait]
impl ChannelFactory for LapinChannelFactory {
    type Resource = BrokerChannel;

    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self, params),
        fields(host = %params.host, port = params.port)
    )]
    async fn create(&self, params: &ConnectionParameters) -> Result<BrokerChannel, anyhow::Error> {
        let connection = self.connect(params).await?;
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open a channel on a new RabbitMQ connection.")?;
        debug!(channel_id = channel.id(), "Created AMQP connection and channel");
        Ok(BrokerChannel {
            connection,
            channel,
        })
    }

    async fn destroy(&self, resource: BrokerChannel) -> Result<(), anyhow::Error> {
        resource
            .connection
            .close(200, "channel recycled")
            .await
            .context("Failed to close RabbitMQ connection.")
    }
}
