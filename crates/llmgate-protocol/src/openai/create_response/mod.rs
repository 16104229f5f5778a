pub mod request;
pub mod response;
pub mod stream;

pub use request::{CreateResponseRequest, CreateResponseRequestBody};
pub use response::{Response, ResponseObjectType, ResponseStatus, ResponseUsage};
pub use stream::ResponseStreamEvent;
