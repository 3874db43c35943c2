//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Scoped logging adapters and lifecycle events."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
/// Emit an informational log enriched with pipeline context.
#[macro_export]
macro_rules! phx_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            scope = ctx.scope.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::phx_info!(context = $crate::LogContext::default(), $($arg)+)
    }};
}

/// Emit a warning enriched with pipeline context.
#[macro_export]
macro_rules! phx_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            scope = ctx.scope.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::phx_warn!(context = $crate::LogContext::default(), $($arg)+)
    }};
}

/// Emit an error log enriched with pipeline context.
#[macro_export]
macro_rules! phx_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            scope = ctx.scope.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        $crate::phx_error!(context = $crate::LogContext::default(), $($arg)+)
    }};
}
