use crate::broker::Message;
use crate::envelope::Payload;
use crate::error::HandlerError;
use crate::handler::{HandlerInput, RawDelivery};
use crate::job::{JobDefinition, JobDescriptor};

/// Decode one message and build the handler input for it.
///
/// Raw-payload jobs get the decoded payload together with the message;
/// everyone else gets the payload's positional `args`.
pub(super) fn prepare(
    job: &JobDefinition,
    descriptor: &mut JobDescriptor,
    message: &Message,
) -> Result<HandlerInput, HandlerError> {
    let payload = Payload::decode(message.data());
    descriptor.created_at = payload.sent_at().or(message.publish_time());
    descriptor.payload = Some(payload.clone());

    if job.uses_raw_payload() {
        return Ok(HandlerInput::Raw(RawDelivery {
            payload,
            message_id: message.id().clone(),
            raw: message.clone(),
        }));
    }

    let args = payload.args()?;
    descriptor.args = args.clone();
    Ok(HandlerInput::Args(args))
}
