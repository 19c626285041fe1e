mod config;
mod core;
mod delegate;
mod distributed;
mod event;
mod factory;
mod manager;
mod registry;
mod resource;
mod single_resource;
mod status;
mod template;


pub use config::*;
pub use self::core::*;
pub use event::*;
pub use factory::*;
pub use manager::*;
pub use registry::*;
pub use resource::*;
pub use single_resource::*;
pub use status::*;
pub use template::*;
