pub mod cancellation;
pub mod context;
pub mod event_bus;
pub mod facts;
pub mod output;
pub mod prompts;
pub mod sandbox;
pub mod turn_loop;

pub use cancellation::*;
pub use context::*;
pub use event_bus::*;
pub use facts::*;
pub use output::*;
pub use sandbox::*;
pub use turn_loop::*;
