//! Wire protocol: envelopes, typed operations, DTO mappers, and the dispatcher.

pub mod dispatcher;
pub mod envelope;
pub mod mapper;
pub mod operation;

pub use dispatcher::Dispatcher;
pub use envelope::{
    ErrorBody, RequestEnvelope, ResponseEnvelope, ResponseMetadata, ResponseStatus,
    PROTOCOL_VERSION,
};
pub use mapper::{
    ConfirmRequestDto, CreateConfirmDto, FromProtocol, TaskAssignmentDto, ToProtocol,
};
pub use operation::Operation;
