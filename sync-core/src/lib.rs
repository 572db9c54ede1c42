pub mod clock;
pub mod consts;
pub mod controller;
pub mod drift;
pub mod messages;
pub mod queue;
