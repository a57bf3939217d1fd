//! Dispatcher: the proxy-side session store (C9), URL matcher (C10),
//! intercepting-proxy addon (C11), and request/response log (C12).

pub mod daily_file;
pub mod log_store;
pub mod provider_registry;
pub mod proxy;
pub mod session_store;
pub mod tunnel_transport;
pub mod url_matcher;
pub mod worker_pool;
pub mod ws_client;

pub use log_store::{IndexRecord, LogStore, RequestRecord, RequestStatus, ResponseRecord};
pub use provider_registry::{ProviderRegistry, ProviderRule, VerificationType};
pub use proxy::{Dispatcher, DispatcherConfig};
pub use session_store::{Session, SessionStatus, SessionStore};
pub use tunnel_transport::RustlsTunnelTransport;
pub use url_matcher::{is_match, score, similarity, MatchResult, DEFAULT_THRESHOLD};
pub use worker_pool::{RejectReason, WorkerPool, WorkerPoolConfig};
pub use ws_client::{AttestorClientPool, WsAttestorClient};
