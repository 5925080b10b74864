pub mod account;
pub mod events;
pub mod order;
pub mod outbox;

pub use account::*;
pub use events::*;
pub use order::*;
pub use outbox::*;
