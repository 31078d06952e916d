//! Function dispatch across fixture channels

pub mod barrier;
pub mod dispatcher;
pub mod registry;

pub use barrier::{BarrierProbe, CompletionBarrier};
pub use dispatcher::{DispatchReport, Dispatcher, FixtureContext};
pub use registry::{
    Classification, FunctionDescriptor, FunctionInfo, FunctionKind, FunctionRegistry,
    SequentialFunction,
};
