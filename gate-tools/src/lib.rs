//! Tools the agent may call, and the registry that classifies them as
//! autonomous or approval-gated.

mod calendar;
mod clock;
mod context;
mod error;
mod registry;
mod traits;

pub use calendar::{CalendarEvent, CalendarStore, CreateCalendarEventTool, ListCalendarEventsTool};
pub use clock::CurrentTimeTool;
pub use context::ToolContext;
pub use error::{Result, ToolError};
pub use registry::{RegisteredTool, RegistryError, ToolKind, ToolRegistry, ToolSummary};
pub use traits::{Approval, Tool, ToolSpec};
