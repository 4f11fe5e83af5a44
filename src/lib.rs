// tradewire: Realtime trading-exchange client.
//
// The core is the messaging engine (pattern matcher, call chain, router,
// request/response resolver) and the WebSocket connection supervisor; the
// REST helper and signing are thin peripherals around the same config.

pub mod chain;
pub mod config;
pub mod error;
pub mod matching;
pub mod resolver;
pub mod rest_client;
pub mod router;
pub mod signing;
pub mod transport;
pub mod ws_client;

pub use chain::{handler_async, handler_fn, CallChain, Handler, Routed};
pub use config::{load_config_from_path, load_config_from_str, AuthConfig, ClientConfig, ConfigError};
pub use error::ClientError;
pub use resolver::{completion, Completion, CompletionSender, DataGetter, RequestResolver, ResponseValidator};
pub use rest_client::RestClient;
pub use router::MessageRouter;
pub use signing::{RestSigner, WsSigner};
pub use transport::{Channel, Connect, WsConnector};
pub use ws_client::{CallbackClient, ConnState, WsClient};
