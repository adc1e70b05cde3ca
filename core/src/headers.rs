// portage/src/headers.rs

//! Well-known message header names and the helpers that read or render them.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Transport-level message headers. Ordered so rendered diagnostics are stable.
pub type Headers = BTreeMap<String, String>;

pub const MESSAGE_ID: &str = "Portage.MessageId";
pub const ENCLOSED_MESSAGE_TYPES: &str = "Portage.EnclosedMessageTypes";
pub const MESSAGE_INTENT: &str = "Portage.MessageIntent";
pub const REPLY_TO_ADDRESS: &str = "Portage.ReplyToAddress";
pub const CORRELATION_ID: &str = "Portage.CorrelationId";
pub const CONVERSATION_ID: &str = "Portage.ConversationId";
pub const RELATED_TO: &str = "Portage.RelatedTo";
pub const TIME_SENT: &str = "Portage.TimeSent";
pub const ORIGINATING_ENDPOINT: &str = "Portage.OriginatingEndpoint";

pub const DELAYED_RETRIES: &str = "Portage.Retries";
pub const DELAYED_RETRIES_TIMESTAMP: &str = "Portage.Retries.Timestamp";

pub const FAILED_QUEUE: &str = "Portage.FailedQ";
pub const TIME_OF_FAILURE: &str = "Portage.TimeOfFailure";
pub const PROCESSING_ENDPOINT: &str = "Portage.ProcessingEndpoint";
pub const EXCEPTION_TYPE: &str = "Portage.ExceptionInfo.ExceptionType";
pub const EXCEPTION_MESSAGE: &str = "Portage.ExceptionInfo.Message";
pub const EXCEPTION_STACK_TRACE: &str = "Portage.ExceptionInfo.StackTrace";
pub const EXCEPTION_STEP: &str = "Portage.ExceptionInfo.Step";

const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S:%6f";

/// Renders a timestamp in the wire format used by every time-valued header.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
  format!("{} Z", at.format(WIRE_TIMESTAMP_FORMAT))
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
  let trimmed = value.strip_suffix(" Z").unwrap_or(value);
  NaiveDateTime::parse_from_str(trimmed, WIRE_TIMESTAMP_FORMAT)
    .ok()
    .map(|naive| naive.and_utc())
}

/// Number of delayed retries already performed, as persisted with the message.
/// A value that does not parse counts as exhausted, so a corrupted header can
/// never restart the delayed tier.
pub fn delayed_retries(headers: &Headers) -> u32 {
  match headers.get(DELAYED_RETRIES) {
    None => 0,
    Some(value) => value.trim().parse().unwrap_or_else(|_| {
      tracing::warn!(header = DELAYED_RETRIES, %value, "Malformed delayed retry count; treating retries as exhausted.");
      u32::MAX
    }),
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIntent {
  Send,
  Publish,
  Reply,
}

impl fmt::Display for MessageIntent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      MessageIntent::Send => "Send",
      MessageIntent::Publish => "Publish",
      MessageIntent::Reply => "Reply",
    };
    f.write_str(name)
  }
}
