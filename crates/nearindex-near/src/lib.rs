//! nearindex-near — NEAR JSON-RPC client, retry policy, fetch dispatcher
//! and builder API.

pub mod builder;
pub mod client;
pub mod dictionary;
pub mod dispatcher;
pub mod retry;
pub mod rpc;

pub use builder::IndexerBuilder;
pub use client::NearRpcClient;
pub use dictionary::GraphqlDictionary;
pub use dispatcher::{FetchDispatcher, RunSummary};
pub use retry::{RetryPolicy, RetryingClient};
pub use rpc::{HttpRpcClient, RpcError};
