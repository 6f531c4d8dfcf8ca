// Method routing table for the MCP façade

/// Notifications forwarded to the child without waiting for a reply.
pub const NOTIFICATION_METHODS: [&str; 3] = [
    "notifications/initialized",
    "initialized",
    "notifications/cancelled",
];

/// Capability namespace a forwarded method belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [Self::Tools, Self::Resources, Self::Prompts];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Tools => "tools/",
            Self::Resources => "resources/",
            Self::Prompts => "prompts/",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::Prompts => "prompts",
        }
    }
}

/// How the façade handles a JSON-RPC method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// `initialize`, forwarded to the child with the long timeout
    Initialize,
    /// Fire-and-forget notification
    Notification,
    /// Forwarded capability call, regardless of the advertised capability lists
    Capability(CapabilityKind),
    /// Answered locally with -32601
    Unsupported,
}

pub fn classify(method: &str) -> MethodKind {
    if method == "initialize" {
        return MethodKind::Initialize;
    }

    if NOTIFICATION_METHODS.contains(&method) {
        return MethodKind::Notification;
    }

    CapabilityKind::ALL
        .into_iter()
        .find(|kind| method.starts_with(kind.prefix()))
        .map(MethodKind::Capability)
        .unwrap_or(MethodKind::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_routing_table() {
        assert_eq!(classify("initialize"), MethodKind::Initialize);
        assert_eq!(classify("notifications/initialized"), MethodKind::Notification);
        assert_eq!(classify("initialized"), MethodKind::Notification);
        assert_eq!(classify("notifications/cancelled"), MethodKind::Notification);
        assert_eq!(
            classify("tools/list"),
            MethodKind::Capability(CapabilityKind::Tools)
        );
        assert_eq!(
            classify("resources/read"),
            MethodKind::Capability(CapabilityKind::Resources)
        );
        assert_eq!(
            classify("prompts/get"),
            MethodKind::Capability(CapabilityKind::Prompts)
        );
        assert_eq!(classify("totally/unknown"), MethodKind::Unsupported);
    }

    #[test]
    fn test_classify_requires_namespace_separator() {
        // "tools" on its own is not a method in the tools namespace
        assert_eq!(classify("tools"), MethodKind::Unsupported);
        assert_eq!(classify("toolsy/list"), MethodKind::Unsupported);
        assert_eq!(classify("notifications/progress"), MethodKind::Unsupported);
        assert_eq!(classify("Initialize"), MethodKind::Unsupported);
    }
}
