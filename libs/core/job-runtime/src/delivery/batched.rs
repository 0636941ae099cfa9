use crate::broker::Message;
use crate::envelope::Payload;
use crate::handler::HandlerInput;
use crate::job::JobDescriptor;

/// Decode every message of a batch, keeping the received order.
///
/// Batched handlers always receive the full list of payloads, whatever the
/// job's raw-payload setting.
pub(super) fn prepare(descriptor: &mut JobDescriptor, messages: &[Message]) -> HandlerInput {
    let payloads: Vec<Payload> = messages.iter().map(|m| Payload::decode(m.data())).collect();

    descriptor.created_at = payloads
        .iter()
        .zip(messages)
        .filter_map(|(payload, message)| payload.sent_at().or(message.publish_time()))
        .min();

    HandlerInput::Batch(payloads)
}
