//! Delayers batch the writes a peer receives. Facts, subscriptions and
//! compound events are buffered, committed in one transaction and then
//! matched against each other in arrival order.

pub mod buffer;
pub mod delayer;
pub mod operator;

pub use buffer::{Buffer, BufferedItem, ItemClass};
pub use delayer::{BufferOperator, Delayer};
pub use operator::PublishSubscribeOperator;
