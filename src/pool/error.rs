/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// A new channel could not be created.
    #[error("Failed to create a RabbitMq channel")]
    Connect(#[source] anyhow::Error),
    #[error("Timed out waiting for a RabbitMq channel to become available")]
    Timeout,
    #[error("The channel pool has been closed")]
    Closed,
    #[error("Invalid channel pool configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Backend(deadpool::unmanaged::PoolError),
}

impl From<deadpool::unmanaged::PoolError> for PoolError {
    fn from(err: deadpool::unmanaged::PoolError) -> Self {
        match err {
            deadpool::unmanaged::PoolError::Closed => Self::Closed,
            deadpool::unmanaged::PoolError::Timeout => Self::Timeout,
            err => Self::Backend(err),
        }
    }
}
