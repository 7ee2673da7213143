pub mod ack_tracker;
pub mod broadcaster;
pub mod fifo;

pub use broadcaster::Broadcaster;
