pub mod events;
pub mod fanout;
pub mod presence;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod stats;
pub mod watermark;
