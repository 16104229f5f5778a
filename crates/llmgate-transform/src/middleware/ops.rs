use super::generate::{transform_generate_request, transform_generate_response};
use super::types::{Op, Request, Response, TransformContext, TransformError};

pub fn transform_request(ctx: &TransformContext, req: Request) -> Result<Request, TransformError> {
    match (ctx.src_op, req) {
        (Op::GenerateContent | Op::StreamGenerateContent, Request::GenerateContent(req)) => {
            transform_generate_request(ctx, req)
        }
    }
}

pub fn transform_response(
    ctx: &TransformContext,
    resp: Response,
) -> Result<Response, TransformError> {
    match (ctx.src_op, resp) {
        (Op::GenerateContent, Response::GenerateContent(resp)) => {
            transform_generate_response(ctx, resp)
        }
        (Op::StreamGenerateContent, Response::GenerateContent(_)) => Err(TransformError::OpMismatch),
    }
}
