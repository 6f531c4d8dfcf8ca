// MCP wire types shared by the adapter core and its HTTP façade
// (JSON-RPC 2.0 envelopes plus the method routing table)

pub mod protocol;
pub mod routing;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use routing::{classify, CapabilityKind, MethodKind};
