pub mod acknowledgements;
pub mod broker;
pub mod channel_state;
pub mod consumer;
pub mod management;
pub mod message;
pub mod publisher;
pub mod reporters;
pub mod serializer;
pub mod waiter;
pub mod worker;
