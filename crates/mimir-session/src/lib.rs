// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod service;
mod types;

pub use service::{MessageEvent, MessageEventKind, Messages, SessionEvent, Sessions};
pub use types::{
    Attachment, FinishReason, Message, Part, Role, Session, ToolCallPart, ToolResultPart,
};
