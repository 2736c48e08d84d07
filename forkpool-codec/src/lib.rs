//! Graph-safe serialization codec for forkpool
//!
//! Converts an argument list into a transmissible string plus side-lists of
//! raw buffers and stream handles, and reverses the process. Circular
//! references, shared references, custom types, dates, regular expressions
//! and non-finite numbers all survive the round trip over a text channel.
//!
//! The encode operation is called *dry*, the decode operation *undry*.

pub mod dry;
pub mod error;
pub mod registry;
pub mod undry;
pub mod value;

pub use dry::{dry, dry_value, DriedPayload, MARKER};
pub use error::CodecError;
pub use registry::{as_remote_error, DryRegistry, RemoteError, UndryFn};
pub use undry::{undry_args, undry_list, undry_value};
pub use value::{ArrayRef, DryType, ObjectRef, RegexValue, StreamHandle, Value};
