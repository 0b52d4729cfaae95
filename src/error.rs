//! The possible error types when using `rankpool`.
use thiserror::Error;

/// An enumeration of `rankpool` errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool or partitioner was given settings it cannot run with, e.g.
    /// fewer than two ranks or a group size of zero
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Ranks of a group disagreed about the shape of the data they hold
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A requested column is neither provided by the data source nor given
    /// a default value
    #[error("column '{column}' is unavailable; valid columns are: {valid:?}")]
    MissingColumn { column: String, valid: Vec<String> },
    /// The total size of a data source was already set to another value
    #[error("data source size has already been set to {current}, refusing to set it to {requested}")]
    SizeConflict { current: usize, requested: usize },
    /// The total size of a data source is not known before it is read
    #[error("data source size is not known before the read operation")]
    SizeUnknown,
    /// A data source does not implement the requested read strategy
    #[error("read strategy not supported by this data source")]
    NotSupported,
    /// A data source failed while reading
    #[error("failure while reading data source: {0}")]
    ReadFailure(String),
    /// A read produced no columns at all
    #[error("data source read did not return any data")]
    NoData,
    /// A read was attempted on a closed `DataStream`
    #[error("read operation on closed data stream")]
    StreamClosed,
    /// A task function failed on one of the ranks
    #[error("task {index} failed: {reason}")]
    TaskFailure { index: usize, reason: String },
    /// No plugin with this name is registered
    #[error("'{0}' does not match the names of any registered plugins")]
    UnknownPlugin(String),
    /// A plugin configuration value had none of the accepted shapes
    #[error("failed to parse plugin from configuration: {0}")]
    PluginConfig(String),
    /// Error with IO
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Error serializing or deserializing a message
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    /// Error parsing a JSON configuration value
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The connection to another rank was closed
    #[error("connection closed")]
    ConnectionClosed,
    /// A message was addressed to a rank that is not in the directory
    #[error("unknown rank id")]
    UnknownId,
    /// A message arrived that the protocol does not allow at this point
    #[error("unexpected message")]
    UnexpectedMessage,
    /// A rank tried to connect twice
    #[error("attempted to reconnect to an already connected rank")]
    ReconnectionError,
}
