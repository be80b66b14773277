pub mod ingress;
pub mod registry;
pub mod server;
pub mod session;

pub use registry::{SessionHandle, SessionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::Session;
