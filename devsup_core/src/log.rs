//! Per-node log filtering on top of `tracing`.
//!
//! Every node carries its own [`LogLevel`](devsup_common::config::LogLevel)
//! (default `warning`). [`node_log!`](crate::node_log) checks that filter and
//! then emits through the matching `tracing` macro with the node's full name
//! attached as a field, so the process-wide subscriber still decides where
//! the message ends up.

/// Log through a node's severity filter.
///
/// ```rust
/// use devsup_core::node::Node;
/// use devsup_core::node_log;
/// use devsup_common::config::LogLevel;
///
/// let node = Node::new("probe1");
/// node.set_log_level(LogLevel::Info);
/// node_log!(node, LogLevel::Info, "temperature {:.1}", 21.5);
/// node_log!(node, LogLevel::Debug, "filtered out");
/// ```
#[macro_export]
macro_rules! node_log {
    ($node:expr, $level:expr, $($arg:tt)+) => {{
        let node = &$node;
        let level = $level;
        if node.log_enabled(level) {
            match level {
                $crate::__private::LogLevel::Debug => {
                    $crate::__private::tracing::debug!(node = %node.full_name(), $($arg)+)
                }
                $crate::__private::LogLevel::Info => {
                    $crate::__private::tracing::info!(node = %node.full_name(), $($arg)+)
                }
                $crate::__private::LogLevel::Warning => {
                    $crate::__private::tracing::warn!(node = %node.full_name(), $($arg)+)
                }
                $crate::__private::LogLevel::Error => {
                    $crate::__private::tracing::error!(node = %node.full_name(), $($arg)+)
                }
                $crate::__private::LogLevel::None => {}
            }
        }
    }};
}
