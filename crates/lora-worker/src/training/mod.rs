pub mod args;
pub mod invoker;
pub mod sniffer;

pub use args::{build_command, TrainingCommand};
pub use invoker::{TrainingInvoker, TrainingReport};
pub use sniffer::{FailureSniffer, MarkerSniffer};
