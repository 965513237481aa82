//! A small railway simulation that plays the part of the host application:
//! it owns the state, announces changes, and answers reads on its own thread.

pub mod model;
mod resolvers;
mod thread;
mod world;

pub use resolvers::resolvers;
pub use thread::SimulationThread;
pub use world::World;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("no car with guid {0}")]
    UnknownCar(String),

    #[error("car {0} cannot be remotely controlled")]
    NotALocomotive(String),

    #[error("no junction with index {0}")]
    UnknownJunction(usize),

    #[error("no job with id {0}")]
    UnknownJob(String),

    #[error("failed to spawn simulation thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("simulation thread panicked")]
    ThreadPanicked,
}
