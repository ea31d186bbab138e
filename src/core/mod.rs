pub mod cancel;

pub mod pipeline;

pub mod stage;
