//! Build metadata shared by the `taskd` server and the `taskd-agent` binary.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildMeta {
    build_id: &'static str,
    build_time: &'static str,
    git_label: &'static str,
}

static META: Lazy<BuildMeta> = Lazy::new(|| BuildMeta {
    build_id: option_env!("TASKD_BUILD_ID").unwrap_or("unknown build"),
    build_time: option_env!("TASKD_BUILD_TIME").unwrap_or("unknown time"),
    git_label: option_env!("TASKD_BUILD_GIT").unwrap_or("unknown git"),
});

/// Full build identifier, e.g. `2026-10-19 08:12:00 UTC | v0.1.0-3-gabc123`.
pub fn build_id() -> &'static str {
    META.build_id
}

pub fn build_timestamp() -> &'static str {
    META.build_time
}

pub fn git_label() -> &'static str {
    META.git_label
}

/// One-line startup banner for a binary.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} | {}", package, version, build_id())
}
