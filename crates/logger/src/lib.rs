mod tracing;

pub use self::tracing::{LogLevel, init_tracing};
