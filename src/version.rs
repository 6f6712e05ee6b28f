/// Shown in the boot banner and reported by `GET /api/ota/status`
pub const DISPLAY_VERSION: &str = "v0.7-console";

pub fn full_version() -> String {
    format!("{} (crate {})", DISPLAY_VERSION, env!("CARGO_PKG_VERSION"))
}
