// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message type codes shared by the worker and the sidecar proxy.
//!
//! Codes are grouped the same way the proxy groups them:
//! - `1..=24`: global messages (connection, domains, workers)
//! - `100..=161`: workflow messages
//! - `200..`: activity messages
//!
//! Every request code `n` is paired with exactly one reply code `n + 1`.

use std::fmt;

use crate::error::CodecError;

macro_rules! message_types {
    ($( $(#[$doc:meta])* $name:ident = $code:expr ),+ $(,)?) => {
        /// Message types for the proxy wire protocol
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum MessageType {
            $( $(#[$doc])* $name = $code, )+
        }

        impl MessageType {
            /// Variant name, as used in diagnostics.
            pub fn name(self) -> &'static str {
                match self {
                    $( MessageType::$name => stringify!($name), )+
                }
            }
        }

        impl TryFrom<i32> for MessageType {
            type Error = CodecError;

            fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
                match value {
                    $( $code => Ok(MessageType::$name), )+
                    _ => Err(CodecError::InvalidMessageType(value)),
                }
            }
        }
    };
}

message_types! {
    /// Placeholder for messages that have not been typed yet
    Unspecified = 0,

    // Global messages
    InitializeRequest = 1,
    InitializeReply = 2,
    ConnectRequest = 3,
    ConnectReply = 4,
    TerminateRequest = 5,
    TerminateReply = 6,
    DomainRegisterRequest = 7,
    DomainRegisterReply = 8,
    DomainDescribeRequest = 9,
    DomainDescribeReply = 10,
    DomainUpdateRequest = 11,
    DomainUpdateReply = 12,
    HeartbeatRequest = 13,
    HeartbeatReply = 14,
    CancelRequest = 15,
    CancelReply = 16,
    NewWorkerRequest = 17,
    NewWorkerReply = 18,
    StopWorkerRequest = 19,
    StopWorkerReply = 20,
    PingRequest = 21,
    PingReply = 22,

    // Workflow messages
    WorkflowRegisterRequest = 100,
    WorkflowRegisterReply = 101,
    WorkflowExecuteRequest = 102,
    WorkflowExecuteReply = 103,
    WorkflowSignalRequest = 104,
    WorkflowSignalReply = 105,
    WorkflowSignalWithStartRequest = 106,
    WorkflowSignalWithStartReply = 107,
    WorkflowTerminateRequest = 110,
    WorkflowTerminateReply = 111,
    WorkflowQueryRequest = 118,
    WorkflowQueryReply = 119,
    WorkflowInvokeRequest = 124,
    WorkflowInvokeReply = 125,
    WorkflowExecuteChildRequest = 126,
    WorkflowExecuteChildReply = 127,
    WorkflowSignalSubscribeRequest = 128,
    WorkflowSignalSubscribeReply = 129,
    WorkflowSignalInvokeRequest = 130,
    WorkflowSignalInvokeReply = 131,
    WorkflowMutableRequest = 132,
    WorkflowMutableReply = 133,
    WorkflowGetVersionRequest = 134,
    WorkflowGetVersionReply = 135,
    WorkflowSetCacheSizeRequest = 136,
    WorkflowSetCacheSizeReply = 137,
    WorkflowGetResultRequest = 138,
    WorkflowGetResultReply = 139,
    WorkflowHasLastResultRequest = 140,
    WorkflowHasLastResultReply = 141,
    WorkflowGetLastResultRequest = 142,
    WorkflowGetLastResultReply = 143,
    WorkflowDisconnectContextRequest = 144,
    WorkflowDisconnectContextReply = 145,
    WorkflowGetTimeRequest = 146,
    WorkflowGetTimeReply = 147,
    WorkflowSleepRequest = 148,
    WorkflowSleepReply = 149,
    WorkflowWaitForChildRequest = 150,
    WorkflowWaitForChildReply = 151,
    WorkflowSignalChildRequest = 152,
    WorkflowSignalChildReply = 153,
    WorkflowCancelChildRequest = 154,
    WorkflowCancelChildReply = 155,
    WorkflowSetQueryHandlerRequest = 158,
    WorkflowSetQueryHandlerReply = 159,
    WorkflowQueryInvokeRequest = 160,
    WorkflowQueryInvokeReply = 161,

    // Activity messages
    ActivityExecuteRequest = 200,
    ActivityExecuteReply = 201,
    ActivityInvokeRequest = 202,
    ActivityInvokeReply = 203,
    ActivityGetHeartbeatDetailsRequest = 204,
    ActivityGetHeartbeatDetailsReply = 205,
    ActivityRecordHeartbeatRequest = 208,
    ActivityRecordHeartbeatReply = 209,
    ActivityHasHeartbeatDetailsRequest = 210,
    ActivityHasHeartbeatDetailsReply = 211,
    /// Sent by the proxy when a running activity must stop
    ActivityStoppingRequest = 212,
    ActivityStoppingReply = 213,
    ActivityExecuteLocalRequest = 214,
    ActivityExecuteLocalReply = 215,
    ActivityInvokeLocalRequest = 216,
    ActivityInvokeLocalReply = 217,
    ActivityRegisterRequest = 218,
    ActivityRegisterReply = 219,
    ActivityCompleteRequest = 222,
    ActivityCompleteReply = 223,
}

impl MessageType {
    /// Numeric wire code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Requests carry odd codes in the global range and even codes elsewhere.
    pub fn is_request(self) -> bool {
        match self {
            MessageType::Unspecified => false,
            _ if self.code() < 100 => self.code() % 2 == 1,
            _ => self.code() % 2 == 0,
        }
    }

    pub fn is_reply(self) -> bool {
        self != MessageType::Unspecified && !self.is_request()
    }

    /// The reply type that answers this request, or `None` for replies.
    pub fn reply_type(self) -> Option<MessageType> {
        if !self.is_request() {
            return None;
        }
        MessageType::try_from(self.code() + 1).ok()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_request_has_a_reply() {
        for code in 0..300 {
            let Ok(message_type) = MessageType::try_from(code) else {
                continue;
            };
            if message_type.is_request() {
                let reply = message_type
                    .reply_type()
                    .unwrap_or_else(|| panic!("{message_type} has no reply type"));
                assert!(reply.is_reply(), "{reply} should be a reply");
                assert_eq!(reply.code(), code + 1);
            }
        }
    }

    #[test]
    fn test_request_reply_classification() {
        assert!(MessageType::InitializeRequest.is_request());
        assert!(MessageType::InitializeReply.is_reply());
        assert!(MessageType::WorkflowInvokeRequest.is_request());
        assert!(MessageType::WorkflowInvokeReply.is_reply());
        assert!(MessageType::ActivityInvokeLocalRequest.is_request());
        assert!(MessageType::ActivityStoppingRequest.is_request());
        assert_eq!(
            MessageType::WorkflowSignalWithStartRequest.reply_type(),
            Some(MessageType::WorkflowSignalWithStartReply)
        );
        assert!(!MessageType::Unspecified.is_request());
        assert!(!MessageType::Unspecified.is_reply());
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            MessageType::try_from(9999),
            Err(CodecError::InvalidMessageType(9999))
        ));
    }

    #[test]
    fn test_display_uses_variant_name() {
        assert_eq!(
            MessageType::WorkflowQueryInvokeReply.to_string(),
            "WorkflowQueryInvokeReply"
        );
    }
}
