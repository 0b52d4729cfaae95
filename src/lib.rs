//! # rankpool
//!
//! `rankpool` runs jobs over a fixed set of cooperating processes, called
//! ranks, that only talk to each other by passing messages. It provides two
//! layers:
//!
//! - a [`TaskPool`], which divides the ranks into worker groups and hands
//!   independent tasks out to them, returning the results in the order the
//!   tasks were given, and
//! - a collective data layer, in which every rank of a group reads the same
//!   dataset through a [`DataSourceHandle`] and gets its share of the rows,
//!   with missing columns filled in from default values.
//!
//! Ranks are connected either in-process with a [`LocalFabric`], or over TCP
//! through a registration [`Server`] and one [`Client`] per rank. On top of
//! either, a [`Communicator`] provides point-to-point messages and the
//! collective operations.
//!
//! [`TaskPool`]: pool/struct.TaskPool.html
//! [`DataSourceHandle`]: data/struct.DataSourceHandle.html
//! [`LocalFabric`]: network/struct.LocalFabric.html
//! [`Server`]: network/struct.Server.html
//! [`Client`]: network/struct.Client.html
//! [`Communicator`]: comm/struct.Communicator.html
pub mod comm;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod network;
pub mod partition;
pub mod pool;
pub mod registry;
pub mod scatter;
