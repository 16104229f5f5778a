mod generate;
mod helpers;
mod ops;
mod stream;
mod types;
mod usage;

#[cfg(test)]
mod tests;

pub use types::{
    GenerateContentRequest, GenerateContentResponse, Op, Proto, Request, Response, StreamEvent,
    StreamFormat, TransformContext, TransformError, stream_format,
};

pub use ops::{transform_request, transform_response};
pub use stream::{NostreamToStream, StreamToNostream, StreamTransformer};
pub use usage::{UsageAccumulator, UsageSummary, usage_from_response};
