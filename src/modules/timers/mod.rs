pub mod model;

pub use model::{AlertRecord, ShownAlertKey, TimerSnapshot};
