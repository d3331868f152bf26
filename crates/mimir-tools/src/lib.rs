// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod registry;
mod tool;

pub use builtin::{BashTool, FetchTool, GlobTool, GrepTool, LsTool, ViewTool};
pub use registry::{ToolSchema, ToolSet};
pub use tool::{AgentTool, OutputKind, PermissionProbe, ToolCall, ToolCtx, ToolResponse};
