mod sink;

pub use sink::RecordingSink;
