//! Shared protocol definitions between the quarry engine and the
//! instrumented target runtime.
//!
//! Both sides agree on a single shared-memory segment. The engine writes a
//! framed request (configuration record + stdin bytes record), the target
//! runtime overwrites the segment with a termination header followed by
//! tagged result records. Everything on the wire is little-endian; the
//! conversion happens here, so the rest of the engine never touches raw
//! byte order.

mod framing;
mod models;
mod types;

pub use models::{StdinModel, StdoutModel};

pub use framing::{
    read_request, read_result, required_shared_memory_size, write_request, write_result,
    FramingError, ResultPayload, TargetConfig, TERMINATION_HEADER_BYTES,
};
pub use types::{
    BrInstrCoverageInfo, BranchingCoverageInfo, DataRecordId, InputType, LocationId,
    TargetTermination,
};
