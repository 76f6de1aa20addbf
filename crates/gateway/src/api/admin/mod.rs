//! Admin endpoints — health, metrics, system info, workspace introspection.
//!
//! All admin-guarded endpoints use the `AdminGuard` extractor (see `guard.rs`),
//! which enforces `SA_ADMIN_TOKEN` auth.  If the env var is unset, endpoints
//! are accessible without auth (dev mode).

mod guard;
mod health;
mod workspace;

// Re-export the guard for use by other modules if needed.
pub use guard::AdminGuard;

// Re-export handler functions so `admin::function_name` paths remain valid.
pub use health::{health, metrics, openapi_spec, restart, save_config, system_info};
pub use workspace::{list_skills_detailed, list_workspace_files};
