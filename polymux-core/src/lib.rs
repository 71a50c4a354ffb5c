mod error;
pub use error::{AnyError, AnyResult};

pub mod action;
pub mod config;
pub mod context;
pub mod handler;
pub mod mapping;
pub mod module;
pub mod processor;
pub mod runtime;
pub mod server;
pub mod session;
pub mod worker;

pub use action::ChannelAction;
pub use handler::{Detection, IoHandler, ProtocolDetector};
pub use session::{Notifier, SessionContext, SessionId};
