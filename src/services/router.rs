//! Install backend routing.
//!
//! The active backend is never stored; it is recomputed from the probe and
//! the recorded installs every time it matters.

use crate::models::{Backend, EnvironmentStatus, PackageState};

use super::environment::YUMIA_EXE_NAME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Yumia,
    Loose,
    /// No backend can take new installs; `next_step` tells the user what to set up.
    Blocked { next_step: String },
}

impl RouteDecision {
    pub fn backend(&self) -> Option<Backend> {
        match self {
            RouteDecision::Yumia => Some(Backend::Yumia),
            RouteDecision::Loose => Some(Backend::Loose),
            RouteDecision::Blocked { .. } => None,
        }
    }
}

/// Decide which backend governs new installs.
///
/// 1. any Yumia record exists: Yumia (switching is an explicit migration)
/// 2. LooseFileLoader is fully installed: Loose
/// 3. the yumia patcher is present: Yumia
/// 4. otherwise blocked
pub fn resolve_backend(env: &EnvironmentStatus, state: &PackageState) -> RouteDecision {
    if state.has_backend(Backend::Yumia) {
        return RouteDecision::Yumia;
    }
    if env.loose_ready() {
        return RouteDecision::Loose;
    }
    if env.yumia_executable_present {
        return RouteDecision::Yumia;
    }
    RouteDecision::Blocked {
        next_step: blocked_next_step(env),
    }
}

fn blocked_next_step(env: &EnvironmentStatus) -> String {
    let missing = env.missing_loose_prerequisites();
    format!(
        "Install the DLL loader and LooseFileLoader into {} (missing: {}), or place {} in {}.",
        env.game_root,
        missing.join(", "),
        YUMIA_EXE_NAME,
        env.package_dir
    )
}

/// Guidance when a loose-only selection is routed to the Yumia backend.
pub fn loose_only_next_step(env: &EnvironmentStatus, state: &PackageState) -> String {
    if !env.loose_ready() {
        format!(
            "This mod only contains loose files. Install the DLL loader and LooseFileLoader (missing: {}).",
            env.missing_loose_prerequisites().join(", ")
        )
    } else if state.has_backend(Backend::Yumia) {
        "This mod only contains loose files. Migrate existing Yumia installs to LooseFileLoader first."
            .to_string()
    } else {
        "This mod only contains loose files. Install it with the LooseFileLoader backend.".to_string()
    }
}
